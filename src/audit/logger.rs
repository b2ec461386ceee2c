use super::{Action, ActionOutcome, ActionRecord, Component};
use crate::errors::GuardError;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Appends [`ActionRecord`]s for one component run.
///
/// Journal writes never fail the action they describe: a write error is
/// logged and the run continues.
pub struct ActionJournal {
    path: PathBuf,
    run_id: Uuid,
    host: String,
    component: Component,
    dry_run: bool,
    planned: Mutex<Vec<String>>,
}

impl ActionJournal {
    pub fn new(path: &Path, component: Component, host: &str, dry_run: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            run_id: Uuid::new_v4(),
            host: host.to_string(),
            component,
            dry_run,
            planned: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Descriptions of every action a dry run would have taken, in order.
    pub fn planned(&self) -> Vec<String> {
        self.planned
            .lock()
            .map(|planned| planned.clone())
            .unwrap_or_default()
    }

    /// Record an action that is about to run (or, in a dry run, that would run)
    /// and log its description. Returns the record for the follow-up outcome.
    pub fn plan(&self, target: &str, action: Action, detail: Option<String>) -> ActionRecord {
        let record = ActionRecord {
            run_id: self.run_id,
            at: Utc::now(),
            host: self.host.clone(),
            component: self.component,
            target: target.to_string(),
            action,
            dry_run: self.dry_run,
            outcome: ActionOutcome::Planned,
            detail,
        };
        if self.dry_run {
            info!(component = %self.component, item = target, action = %action, "would {}", record.describe());
            if let Ok(mut planned) = self.planned.lock() {
                planned.push(record.describe());
            }
            self.append(&record);
        } else {
            info!(component = %self.component, item = target, action = %action, "{}", record.describe());
        }
        record
    }

    pub fn succeeded(&self, mut record: ActionRecord) {
        record.at = Utc::now();
        record.outcome = ActionOutcome::Succeeded;
        self.append(&record);
    }

    pub fn failed(&self, mut record: ActionRecord, error: &str) {
        record.at = Utc::now();
        record.outcome = ActionOutcome::Failed;
        record.detail = Some(match record.detail.take() {
            Some(detail) => format!("{}; {}", detail, error),
            None => error.to_string(),
        });
        self.append(&record);
    }

    /// Record the outcome of an executed action and hand the result back.
    pub fn settle<T>(
        &self,
        record: ActionRecord,
        result: Result<T, GuardError>,
    ) -> Result<T, GuardError> {
        match &result {
            Ok(_) => self.succeeded(record),
            Err(e) => self.failed(record, &e.to_string()),
        }
        result
    }

    fn append(&self, record: &ActionRecord) {
        if let Err(e) = self.try_append(record) {
            warn!(path = %self.path.display(), error = %e, "failed to write action journal");
        }
    }

    fn try_append(&self, record: &ActionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let line = serde_json::to_string(record).context("Failed to serialize action record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Read every record in a journal. Unparseable lines are skipped with a warning.
pub fn read_journal(path: &Path) -> Result<Vec<ActionRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping malformed journal line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn journal(dir: &TempDir, dry_run: bool) -> ActionJournal {
        ActionJournal::new(
            &dir.path().join("state/journal.jsonl"),
            Component::Reconcile,
            "build-01",
            dry_run,
        )
    }

    #[test]
    fn test_success_and_failure_are_appended() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir, false);
        let push = journal.plan("repo-x", Action::RescuePush, Some("rescue-h-x-1".into()));
        journal.succeeded(push);
        let reset = journal.plan("repo-x", Action::Reset, None);
        journal.failed(reset, "index.lock exists");

        let records = read_journal(&dir.path().join("state/journal.jsonl")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, Action::RescuePush);
        assert_eq!(records[0].outcome, ActionOutcome::Succeeded);
        assert_eq!(records[1].outcome, ActionOutcome::Failed);
        assert_eq!(records[1].detail.as_deref(), Some("index.lock exists"));
        assert!(records.iter().all(|r| r.run_id == journal.run_id()));
        assert!(records.iter().all(|r| r.host == "build-01" && !r.dry_run));
    }

    #[test]
    fn test_dry_run_plans_are_journaled() {
        let dir = TempDir::new().unwrap();
        let journal = journal(&dir, true);
        journal.plan("repo-x", Action::Fetch, None);
        let records = read_journal(&dir.path().join("state/journal.jsonl")).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].dry_run);
        assert_eq!(records[0].outcome, ActionOutcome::Planned);
        assert_eq!(journal.planned(), vec!["reconcile: fetch repo-x"]);
    }

    #[test]
    fn test_read_missing_journal_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_journal(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/journal.jsonl");
        let journal = journal(&dir, false);
        let record = journal.plan("repo-x", Action::Clean, None);
        journal.succeeded(record);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        assert_eq!(read_journal(&path).unwrap().len(), 1);
    }
}
