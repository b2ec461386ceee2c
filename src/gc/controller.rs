use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Classification, Disposal, GcDecision, GcInput, GcPolicy, GcReason, WorkspaceDisposer, classify};
use crate::errors::GuardError;
use crate::github::{CodeHost, PullRequestRecord};
use crate::inspector::{Inspection, Inspector, ReferenceBranch, RepoState};
use crate::layout::{
    CanonicalRepository, WorkspaceRef, canonical_for, discover_workspaces, remove_task_dir_if_empty,
};
use crate::lock::SessionLockManager;
use crate::report::{ItemOutcome, RunReport};
use crate::util::hours_between;

/// Inputs gathered for one workspace in one run. Never reused across runs.
struct Evaluation {
    classification: Classification,
    state: Option<RepoState>,
    reference: Option<ReferenceBranch>,
    trunk: String,
    age_hours: i64,
    note: Option<String>,
}

impl Evaluation {
    fn detail(&self) -> String {
        let mut detail = format!(
            "{} (age {}h)",
            self.classification.reason.describe(),
            self.age_hours
        );
        if let Some(note) = &self.note {
            detail.push_str(": ");
            detail.push_str(note);
        }
        detail
    }
}

enum Carried {
    Removed { archive: Option<String>, pushed: Option<String> },
    /// A session lock appeared between classification and removal
    BecameActive,
}

pub struct WorkspaceLifecycleController<'a> {
    workspace_root: &'a std::path::Path,
    canonicals: &'a [CanonicalRepository],
    policy: GcPolicy,
    inspector: &'a Inspector,
    locks: &'a SessionLockManager,
    code_host: &'a dyn CodeHost,
    disposer: WorkspaceDisposer<'a>,
}

impl<'a> WorkspaceLifecycleController<'a> {
    pub fn new(
        workspace_root: &'a std::path::Path,
        canonicals: &'a [CanonicalRepository],
        policy: GcPolicy,
        inspector: &'a Inspector,
        locks: &'a SessionLockManager,
        code_host: &'a dyn CodeHost,
        disposer: WorkspaceDisposer<'a>,
    ) -> Self {
        Self {
            workspace_root,
            canonicals,
            policy,
            inspector,
            locks,
            code_host,
            disposer,
        }
    }

    /// Classify every workspace under the root and carry out the destructive
    /// dispositions. Per-workspace failures are recorded and skipped.
    pub async fn run(&self, report: &mut RunReport, now: DateTime<Utc>) {
        let dry_run = self.disposer.journal().is_dry_run();
        let mut emptied = BTreeSet::new();

        for ws in discover_workspaces(self.workspace_root) {
            let target = ws.id.to_string();
            let eval = self.evaluate(&ws, now).await;
            let decision = eval.classification.decision;
            debug!(workspace = %target, decision = %decision, age_hours = eval.age_hours, "classified");

            match decision {
                GcDecision::Keep => {
                    let outcome = if eval.classification.reason == GcReason::Locked {
                        ItemOutcome::Skipped
                    } else {
                        ItemOutcome::Noop
                    };
                    report.record(&target, outcome, Some(decision.as_str()), Some(eval.detail()));
                }
                GcDecision::Escalate => {
                    warn!(workspace = %target, reason = eval.classification.reason.describe(), "escalated");
                    report.record(
                        &target,
                        ItemOutcome::Escalated,
                        Some(decision.as_str()),
                        Some(eval.detail()),
                    );
                    if eval.classification.reason == GcReason::DirtyStale {
                        report.note_dirty_stale();
                    }
                }
                GcDecision::SafeDelete | GcDecision::Archive => match self.carry_out(&ws, &eval).await {
                    Ok(Carried::Removed { archive, pushed }) => {
                        let mut detail = eval.detail();
                        if let Some(pushed) = pushed {
                            detail.push_str(&format!("; pushed {}", pushed));
                        }
                        if let Some(archive) = archive {
                            detail.push_str(&format!("; archive {}", archive));
                        }
                        let outcome = if dry_run {
                            ItemOutcome::Planned
                        } else {
                            ItemOutcome::Acted
                        };
                        report.record(&target, outcome, Some(decision.as_str()), Some(detail));
                        emptied.insert(ws.id.task_id.clone());
                    }
                    Ok(Carried::BecameActive) => {
                        report.record(
                            &target,
                            ItemOutcome::Skipped,
                            Some(GcDecision::Keep.as_str()),
                            Some("session lock appeared before removal".to_string()),
                        );
                    }
                    Err(e) => report.fail(&target, Some(decision.as_str()), &e),
                },
            }
        }

        if dry_run {
            return;
        }
        for task_id in emptied {
            match remove_task_dir_if_empty(self.workspace_root, &task_id) {
                Ok(true) => info!(task = %task_id, "removed empty task directory"),
                Ok(false) => {}
                Err(e) => warn!(task = %task_id, error = %e, "task directory not removed"),
            }
        }
    }

    async fn evaluate(&self, ws: &WorkspaceRef, now: DateTime<Utc>) -> Evaluation {
        let canonical = canonical_for(self.canonicals, &ws.id.repo);
        let freshness = self.locks.freshness(&ws.path);
        let lock_fresh = freshness.is_fresh();
        let (reference, trunk) = self.inspector.workspace_reference(ws, canonical);

        let state = match self.inspector.inspect(&ws.path, reference.as_ref()) {
            Inspection::Known(state) => state,
            Inspection::Unknown { reason } => {
                let classification = if lock_fresh {
                    classify(
                        &GcInput {
                            merged: false,
                            dirty: false,
                            age_hours: 0,
                            lock_fresh,
                        },
                        &self.policy,
                    )
                } else {
                    Classification::unknown()
                };
                return Evaluation {
                    classification,
                    state: None,
                    reference,
                    trunk,
                    age_hours: 0,
                    note: Some(reason),
                };
            }
        };

        let merged_by_git = reference.is_some() && state.ahead == 0;
        let pr = match state.branch.as_deref() {
            Some(branch) if !merged_by_git && !lock_fresh && branch != trunk => {
                self.lookup_pr(ws, branch).await
            }
            _ => None,
        };
        let merged = merged_by_git || pr.as_ref().is_some_and(PullRequestRecord::is_merged_or_closed);

        let last_activity = [
            state.last_commit_at,
            freshness.last_touched(),
            pr.as_ref().and_then(|p| p.merged_at),
        ]
        .into_iter()
        .flatten()
        .max();
        let age_hours = last_activity.map_or(0, |at| hours_between(at, now));

        let input = GcInput {
            merged,
            dirty: state.dirty,
            age_hours,
            lock_fresh,
        };
        Evaluation {
            classification: classify(&input, &self.policy),
            note: pr.map(|p| format!("PR #{} {:?}", p.number, p.state)),
            state: Some(state),
            reference,
            trunk,
            age_hours,
        }
    }

    /// A failed lookup is treated as "no PR": the workspace then counts as
    /// unmerged, which never leads to deletion without a prior push.
    async fn lookup_pr(&self, ws: &WorkspaceRef, branch: &str) -> Option<PullRequestRecord> {
        match self.code_host.pr_for_branch(&ws.path, branch).await {
            Ok(pr) => pr,
            Err(e) => {
                warn!(workspace = %ws.id, branch, error = %e, "PR lookup failed");
                None
            }
        }
    }

    async fn carry_out(&self, ws: &WorkspaceRef, eval: &Evaluation) -> Result<Carried, GuardError> {
        let Some(state) = &eval.state else {
            return Err(GuardError::InvariantViolation(format!(
                "{}: destructive decision without a known state",
                ws.id
            )));
        };
        let canonical = canonical_for(self.canonicals, &ws.id.repo);
        let pushed = self.disposer.make_durable(ws, state, &eval.trunk).await?;

        if !self.disposer.journal().is_dry_run() {
            if self.locks.freshness(&ws.path).is_fresh() {
                return Ok(Carried::BecameActive);
            }
            self.recheck(ws, state, eval.reference.as_ref())?;
        }

        let disposal = match eval.classification.decision {
            GcDecision::Archive => Disposal::Archive,
            _ => Disposal::Delete,
        };
        let archive = self
            .disposer
            .dispose(ws, canonical, state.branch.as_deref(), &eval.trunk, disposal)
            .await?;
        Ok(Carried::Removed {
            archive: archive.map(|p| p.display().to_string()),
            pushed,
        })
    }

    /// Dirtiness is read again right before removal, never carried over.
    fn recheck(
        &self,
        ws: &WorkspaceRef,
        before: &RepoState,
        reference: Option<&ReferenceBranch>,
    ) -> Result<(), GuardError> {
        let now = match self.inspector.inspect(&ws.path, reference) {
            Inspection::Known(state) => state,
            Inspection::Unknown { reason } => {
                return Err(GuardError::TransientIo(format!(
                    "state unknown before removal: {}",
                    reason
                )));
            }
        };
        if now.dirty {
            return Err(GuardError::InvariantViolation(format!(
                "{}: became dirty before removal",
                ws.id
            )));
        }
        if now.head != before.head {
            return Err(GuardError::InvariantViolation(format!(
                "{}: HEAD moved before removal",
                ws.id
            )));
        }
        Ok(())
    }
}
