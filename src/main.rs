use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use trunkguard::config::Config;
use trunkguard::guard_config::{LogFormat, Role};

mod cmd;

#[derive(Parser)]
#[command(name = "trunkguard")]
#[command(
    version,
    about = "Keeps canonical clones on trunk and collects task workspaces without losing work"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    /// Config file (defaults to $TRUNKGUARD_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured controller role
    #[arg(long, global = true)]
    pub role: Option<Role>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bring every canonical clone back to a clean, up-to-date trunk
    Reconcile {
        #[arg(long)]
        dry_run: bool,
        /// Only reconcile this repository
        #[arg(long)]
        repo: Option<String>,
    },
    /// Classify task workspaces and delete, archive or escalate them
    Gc {
        #[arg(long)]
        dry_run: bool,
    },
    /// Push unpushed workspace branches and open draft pull requests
    Janitor {
        #[arg(long)]
        dry_run: bool,
        /// Maximum draft pull requests to create this run
        #[arg(long)]
        budget: Option<usize>,
    },
    /// Unstick the merge queue: disable auto-merge, request updates, close empty rescues
    QueueEnforce {
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove every workspace of one task
    Cleanup {
        task_id: String,
        #[arg(long)]
        dry_run: bool,
        /// Evacuate dirty or unpushed work instead of refusing
        #[arg(long)]
        force: bool,
    },
    /// Inspect or change the session lock on a path
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Print the health digest from the latest run reports
    Status,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum LockCommands {
    /// Mark a path as in use by this host
    Touch { path: PathBuf },
    /// Remove the lock from a path
    Clear { path: PathBuf },
    /// Show whether a path is locked
    Status { path: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

/// Stderr logging, plus a daily-rolling JSON file when `[logging] file` is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(config: &Config, verbose: bool) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = match config.logging.format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let mut guard = None;
    let file_layer = if config.logging.file {
        let dir = config.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let (writer, worker) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "trunkguard.log"));
        guard = Some(worker);
        Some(fmt::layer().json().with_ansi(false).with_writer(writer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Config commands must work on a file that does not load.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(cli.config.as_deref(), command.clone());
    }

    let config = Config::load(cli.config.as_deref())?.with_role(cli.role);
    let _log_guard = init_tracing(&config, cli.verbose)?;

    match &cli.command {
        Commands::Reconcile { dry_run, repo } => {
            cmd::cmd_reconcile(config, *dry_run, repo.as_deref()).await?
        }
        Commands::Gc { dry_run } => cmd::cmd_gc(config, *dry_run).await?,
        Commands::Janitor { dry_run, budget } => {
            cmd::cmd_janitor(config.with_pr_budget(*budget), *dry_run).await?
        }
        Commands::QueueEnforce { dry_run } => cmd::cmd_queue_enforce(config, *dry_run).await?,
        Commands::Cleanup {
            task_id,
            dry_run,
            force,
        } => cmd::cmd_cleanup(config, task_id, *dry_run, *force, cli.yes).await?,
        Commands::Lock { command } => cmd::cmd_lock(&config, command.clone())?,
        Commands::Status => cmd::cmd_status(&config, cli.verbose)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
