//! Append-only journal of every planned or executed side effect.
//!
//! One JSON object per line in `<state_dir>/journal.jsonl`. Dry runs are
//! journaled too, so a destructive run can be compared against its preview.

mod logger;

pub use logger::{ActionJournal, read_journal};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which scheduled entry point produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Reconcile,
    Gc,
    Janitor,
    QueueEnforce,
    Cleanup,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Reconcile,
        Component::Gc,
        Component::Janitor,
        Component::QueueEnforce,
        Component::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Reconcile => "reconcile",
            Component::Gc => "gc",
            Component::Janitor => "janitor",
            Component::QueueEnforce => "queue-enforce",
            Component::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Fetch,
    PushBranch,
    RescuePush,
    Checkout,
    Reset,
    Clean,
    Delete,
    Archive,
    PrCreate,
    PrUpdateBranch,
    PrDisableAutoMerge,
    PrClose,
}

impl Action {
    /// Actions that can lose local state if run at the wrong moment.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Action::Checkout | Action::Reset | Action::Clean | Action::Delete | Action::Archive
        )
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Fetch => "fetch",
            Action::PushBranch => "push branch",
            Action::RescuePush => "push rescue branch",
            Action::Checkout => "force checkout",
            Action::Reset => "hard reset",
            Action::Clean => "clean untracked",
            Action::Delete => "delete",
            Action::Archive => "archive",
            Action::PrCreate => "create draft PR",
            Action::PrUpdateBranch => "update PR branch",
            Action::PrDisableAutoMerge => "disable auto-merge",
            Action::PrClose => "close PR and delete branch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Dry run: described, not executed
    Planned,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub host: String,
    pub component: Component,
    /// Repository name, workspace id or PR reference
    pub target: String,
    pub action: Action,
    pub dry_run: bool,
    pub outcome: ActionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionRecord {
    /// The line printed for `--dry-run` and logged before the real action.
    pub fn describe(&self) -> String {
        let mut line = format!("{}: {} {}", self.component, self.action, self.target);
        if let Some(detail) = &self.detail {
            line.push_str(&format!(" ({})", detail));
        }
        line
    }
}
