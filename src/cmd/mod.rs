//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled   |
//! |-------------|--------------------|
//! | `reconcile` | `Reconcile`        |
//! | `gc`        | `Gc`               |
//! | `janitor`   | `Janitor`          |
//! | `queue`     | `QueueEnforce`     |
//! | `cleanup`   | `Cleanup`          |
//! | `lock`      | `Lock`             |
//! | `status`    | `Status`           |
//! | `config`    | `Config`           |

pub mod cleanup;
pub mod config;
pub mod gc;
pub mod janitor;
pub mod lock;
pub mod queue;
pub mod reconcile;
pub mod status;

pub use cleanup::cmd_cleanup;
pub use config::cmd_config;
pub use gc::cmd_gc;
pub use janitor::cmd_janitor;
pub use lock::cmd_lock;
pub use queue::cmd_queue_enforce;
pub use reconcile::cmd_reconcile;
pub use status::cmd_status;

use std::sync::Arc;

use anyhow::Result;
use console::style;
use tracing::{debug, info};

use trunkguard::audit::{ActionJournal, Component};
use trunkguard::config::Config;
use trunkguard::exec::{CommandRunner, TokioCommandRunner};
use trunkguard::git::{self, GitCli};
use trunkguard::github::{self, GhCli};
use trunkguard::lock::RunLock;
use trunkguard::report::{ItemOutcome, RunReport};

/// Everything a component run needs, held for the duration of the run.
///
/// Opening a run checks the configuration and external tools, then takes
/// the per-host run lock for the component.
pub struct RunContext {
    pub config: Config,
    pub runner: Arc<dyn CommandRunner>,
    pub git: GitCli,
    pub journal: ActionJournal,
    _run_lock: RunLock,
}

impl RunContext {
    /// `Ok(None)` when another invocation of the same component holds the
    /// run lock on this host.
    pub async fn open(config: Config, component: Component, dry_run: bool) -> Result<Option<Self>> {
        config.require_canonical_root()?;
        config.ensure_directories()?;

        let Some(run_lock) = RunLock::try_acquire(&config.locks_dir(), component.as_str())? else {
            info!(component = %component, "another run holds the lock, superseded");
            println!(
                "{} {} is already running on this host",
                style("superseded:").yellow(),
                component
            );
            return Ok(None);
        };
        debug!(path = %run_lock.path().display(), "run lock acquired");

        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        git::ensure_available(runner.as_ref()).await?;

        let git = GitCli::new(runner.clone(), config.network_timeout, config.local_timeout);
        let journal = ActionJournal::new(&config.journal_path(), component, &config.host, dry_run);
        Ok(Some(Self {
            config,
            runner,
            git,
            journal,
            _run_lock: run_lock,
        }))
    }

    /// The code host, after confirming `gh` is installed.
    pub async fn require_code_host(&self) -> Result<GhCli> {
        github::ensure_available(self.runner.as_ref()).await?;
        Ok(self.code_host())
    }

    pub fn code_host(&self) -> GhCli {
        GhCli::new(self.runner.clone(), self.config.network_timeout)
            .with_list_limit(self.config.pr_list_limit)
    }

    pub fn new_report(&self, component: Component) -> RunReport {
        RunReport::new(
            component,
            self.journal.run_id(),
            &self.config.host,
            self.journal.is_dry_run(),
        )
    }

    /// Close the report, print the plan or summary, and persist it.
    pub fn finish(&self, mut report: RunReport) -> Result<()> {
        report.finish();

        if self.journal.is_dry_run() {
            let planned = self.journal.planned();
            println!();
            if planned.is_empty() {
                println!("{}", style("Dry run: nothing would change.").dim());
            } else {
                println!("{}", style("Dry run: would perform").bold());
                for line in planned {
                    println!("  - {}", line);
                }
            }
        }

        print_report(&report, false);
        if let Some(path) = report.save(&self.config.reports_dir())? {
            debug!(path = %path.display(), "run report saved");
        }
        Ok(())
    }
}

/// One-line count summary, plus every non-noop item when `verbose`.
pub fn print_report(report: &RunReport, verbose: bool) {
    let counts = &report.counts;
    let header = format!(
        "{}: processed={} acted={} skipped={} failed={} escalated={}",
        report.component,
        counts.processed,
        counts.acted,
        counts.skipped,
        counts.failed,
        counts.escalated
    );
    if report.is_healthy() {
        println!("{}", style(header).green());
    } else {
        println!("{}", style(header).yellow());
    }
    if let Some(reason) = &report.skipped_reason {
        println!("  skipped: {}", reason);
    }

    for item in &report.items {
        let notable = !matches!(item.outcome, ItemOutcome::Noop | ItemOutcome::Skipped);
        if !(verbose || notable) {
            continue;
        }
        let outcome = format!("{:?}", item.outcome).to_lowercase();
        let outcome = match item.outcome {
            ItemOutcome::Failed | ItemOutcome::Escalated => style(outcome).red(),
            ItemOutcome::Deferred => style(outcome).yellow(),
            _ => style(outcome).cyan(),
        };
        let mut line = format!("  {} {}", outcome, item.target);
        if let Some(decision) = &item.decision {
            line.push_str(&format!(" [{}]", decision));
        }
        if let Some(detail) = &item.detail {
            line.push_str(&format!(": {}", detail));
        }
        println!("{}", line);
    }
}
