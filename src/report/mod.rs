//! Per-run outcome accounting.
//!
//! Every component loop records one [`ItemReport`] per repository, workspace or
//! pull request and keeps going on failure. The finished [`RunReport`] is
//! persisted as `<state_dir>/reports/<component>.json` and feeds the digest.

mod digest;

pub use digest::{MAX_DIGEST_LINES, render_digest};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::Component;
use crate::errors::{ErrorKind, GuardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Already in the desired state
    Noop,
    /// Deliberately left alone (lock, cooldown, unknown state)
    Skipped,
    /// Side effects executed
    Acted,
    /// Dry run: side effects described only
    Planned,
    Escalated,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub target: String,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub processed: usize,
    pub acted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub escalated: usize,
    pub dirty_stale: usize,
    pub deferred_prs: usize,
    pub invariant_violations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub component: Component,
    pub host: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items: Vec<ItemReport>,
    pub counts: Counts,
    /// Set when the run was skipped as a whole (superseded, not leader)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl RunReport {
    pub fn new(component: Component, run_id: Uuid, host: &str, dry_run: bool) -> Self {
        Self {
            run_id,
            component,
            host: host.to_string(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            items: Vec::new(),
            counts: Counts::default(),
            skipped_reason: None,
        }
    }

    pub fn record(
        &mut self,
        target: &str,
        outcome: ItemOutcome,
        decision: Option<&str>,
        detail: Option<String>,
    ) {
        self.counts.processed += 1;
        match outcome {
            ItemOutcome::Acted | ItemOutcome::Planned => self.counts.acted += 1,
            ItemOutcome::Skipped => self.counts.skipped += 1,
            ItemOutcome::Escalated => self.counts.escalated += 1,
            ItemOutcome::Deferred => self.counts.deferred_prs += 1,
            ItemOutcome::Failed => self.counts.failed += 1,
            ItemOutcome::Noop => {}
        }
        self.items.push(ItemReport {
            target: target.to_string(),
            outcome,
            decision: decision.map(str::to_string),
            detail,
            error_kind: None,
        });
    }

    /// Record a per-item failure. Invariant violations are logged at the
    /// highest severity; everything else is a warning and the run goes on.
    pub fn fail(&mut self, target: &str, decision: Option<&str>, err: &GuardError) {
        let kind = err.kind();
        match kind {
            ErrorKind::InvariantViolation => {
                self.counts.invariant_violations += 1;
                error!(component = %self.component, item = target, error = %err, "invariant violation, item aborted");
            }
            ErrorKind::StateAmbiguous => {
                warn!(component = %self.component, item = target, error = %err, "escalating");
            }
            _ => warn!(component = %self.component, item = target, error = %err, "item failed"),
        }

        let outcome = if kind == ErrorKind::StateAmbiguous {
            ItemOutcome::Escalated
        } else {
            ItemOutcome::Failed
        };
        self.record(target, outcome, decision, Some(err.to_string()));
        if let Some(item) = self.items.last_mut() {
            item.error_kind = Some(kind);
        }
    }

    pub fn note_dirty_stale(&mut self) {
        self.counts.dirty_stale += 1;
    }

    pub fn skip_run(&mut self, reason: &str) {
        self.skipped_reason = Some(reason.to_string());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn is_healthy(&self) -> bool {
        self.counts.failed == 0
            && self.counts.escalated == 0
            && self.counts.dirty_stale == 0
            && self.counts.deferred_prs == 0
            && self.counts.invariant_violations == 0
    }

    pub fn path_in(reports_dir: &Path, component: Component) -> PathBuf {
        reports_dir.join(format!("{}.json", component))
    }

    /// Write the report, replacing the previous run of the same component.
    /// Dry runs are not persisted so they never mask a real run's findings.
    pub fn save(&self, reports_dir: &Path) -> Result<Option<PathBuf>> {
        if self.dry_run {
            return Ok(None);
        }
        fs::create_dir_all(reports_dir)
            .with_context(|| format!("Failed to create {}", reports_dir.display()))?;
        let path = Self::path_in(reports_dir, self.component);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Some(path))
    }

    pub fn load(reports_dir: &Path, component: Component) -> Result<Option<Self>> {
        let path = Self::path_in(reports_dir, component);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let report = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(report))
    }

    /// Latest report of every component that has run on this host.
    pub fn load_all(reports_dir: &Path) -> Result<Vec<Self>> {
        let mut reports = Vec::new();
        for component in Component::ALL {
            if let Some(report) = Self::load(reports_dir, component)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}
