//! Workspace garbage collection.
//!
//! [`classify`] is the pure decision table. [`WorkspaceLifecycleController`]
//! gathers its inputs fresh on every run and carries out the two destructive
//! dispositions through [`WorkspaceDisposer`].

mod controller;
mod dispose;

pub use controller::WorkspaceLifecycleController;
pub use dispose::{Disposal, WorkspaceDisposer, archive_file_name};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Merged workspaces younger than this are kept
    pub cooldown_hours: i64,
    /// Unmerged workspaces at least this old are archived or escalated
    pub archive_after_hours: i64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            archive_after_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcDecision {
    SafeDelete,
    Archive,
    Keep,
    Escalate,
}

impl GcDecision {
    pub fn is_destructive(&self) -> bool {
        matches!(self, GcDecision::SafeDelete | GcDecision::Archive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GcDecision::SafeDelete => "safe_delete",
            GcDecision::Archive => "archive",
            GcDecision::Keep => "keep",
            GcDecision::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for GcDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which row of the table produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcReason {
    Locked,
    MergedAndCooled,
    Cooldown,
    MergedButDirty,
    Abandoned,
    DirtyStale,
    Young,
    /// State could not be read
    Unknown,
}

impl GcReason {
    pub fn describe(&self) -> &'static str {
        match self {
            GcReason::Locked => "session lock is fresh",
            GcReason::MergedAndCooled => "merged, clean, past cooldown",
            GcReason::Cooldown => "merged recently, cooling down",
            GcReason::MergedButDirty => "merged upstream but has local edits",
            GcReason::Abandoned => "unmerged, clean, past archive threshold",
            GcReason::DirtyStale => "unmerged, dirty, past archive threshold",
            GcReason::Young => "active or recent",
            GcReason::Unknown => "state unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcInput {
    pub merged: bool,
    pub dirty: bool,
    pub age_hours: i64,
    pub lock_fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub decision: GcDecision,
    pub reason: GcReason,
}

impl Classification {
    fn new(decision: GcDecision, reason: GcReason) -> Self {
        Self { decision, reason }
    }

    /// Unreadable state is escalated: visible to a human, never destructive.
    pub fn unknown() -> Self {
        Self::new(GcDecision::Escalate, GcReason::Unknown)
    }
}

/// First matching rule wins. Both destructive outcomes require `dirty == false`.
pub fn classify(input: &GcInput, policy: &GcPolicy) -> Classification {
    use GcDecision::*;

    if input.lock_fresh {
        return Classification::new(Keep, GcReason::Locked);
    }
    let stale = input.age_hours >= policy.archive_after_hours;
    match (input.merged, input.dirty) {
        (true, false) if input.age_hours >= policy.cooldown_hours => {
            Classification::new(SafeDelete, GcReason::MergedAndCooled)
        }
        (true, false) => Classification::new(Keep, GcReason::Cooldown),
        (true, true) => Classification::new(Escalate, GcReason::MergedButDirty),
        (false, false) if stale => Classification::new(Archive, GcReason::Abandoned),
        (false, true) if stale => Classification::new(Escalate, GcReason::DirtyStale),
        _ => Classification::new(Keep, GcReason::Young),
    }
}
