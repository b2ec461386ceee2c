//! Explicit removal of every workspace of one task.
//!
//! Clean, durable workspaces go straight away. Anything holding unpushed
//! work is refused unless forced, and forcing evacuates it first.

use tracing::{info, warn};

use crate::errors::GuardError;
use crate::gc::{Disposal, WorkspaceDisposer};
use crate::inspector::{Inspection, Inspector, ReferenceBranch, RepoState, changed_paths};
use crate::layout::{
    CanonicalRepository, WorkspaceRef, canonical_for, remove_task_dir_if_empty, task_workspaces,
    validate_task_id,
};
use crate::lock::SessionLockManager;
use crate::report::{ItemOutcome, RunReport};
use crate::rescue::{RescueEvacuator, RescueKind, RescueTarget, ResetPermit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed { preserved: Vec<String> },
    Refused(String),
}

pub struct TaskCleanup<'a> {
    canonicals: &'a [CanonicalRepository],
    inspector: &'a Inspector,
    locks: &'a SessionLockManager,
    evacuator: RescueEvacuator<'a>,
    disposer: WorkspaceDisposer<'a>,
}

impl<'a> TaskCleanup<'a> {
    pub fn new(
        canonicals: &'a [CanonicalRepository],
        inspector: &'a Inspector,
        locks: &'a SessionLockManager,
        evacuator: RescueEvacuator<'a>,
        disposer: WorkspaceDisposer<'a>,
    ) -> Self {
        Self {
            canonicals,
            inspector,
            locks,
            evacuator,
            disposer,
        }
    }

    /// The workspaces `run` would visit, for confirmation prompts.
    pub fn targets(workspace_root: &std::path::Path, task_id: &str) -> Result<Vec<WorkspaceRef>, GuardError> {
        validate_task_id(task_id)?;
        Ok(task_workspaces(workspace_root, task_id))
    }

    pub async fn run(
        &self,
        workspace_root: &std::path::Path,
        task_id: &str,
        force: bool,
        report: &mut RunReport,
    ) -> Result<(), GuardError> {
        let workspaces = Self::targets(workspace_root, task_id)?;
        if workspaces.is_empty() {
            report.skip_run(&format!("no workspaces for task '{}'", task_id));
            return Ok(());
        }

        let dry_run = self.disposer.journal().is_dry_run();
        for ws in &workspaces {
            let target = ws.id.to_string();
            match self.cleanup_one(ws, force).await {
                Ok(CleanupOutcome::Removed { preserved }) => {
                    let outcome = if dry_run {
                        ItemOutcome::Planned
                    } else {
                        ItemOutcome::Acted
                    };
                    let detail = (!preserved.is_empty()).then(|| format!("preserved on {}", preserved.join(", ")));
                    report.record(&target, outcome, Some("remove"), detail);
                }
                Ok(CleanupOutcome::Refused(reason)) => {
                    report.record(&target, ItemOutcome::Skipped, Some("refused"), Some(reason));
                }
                Err(e) => report.fail(&target, Some("remove"), &e),
            }
        }

        if !dry_run {
            match remove_task_dir_if_empty(workspace_root, task_id) {
                Ok(true) => info!(task = task_id, "task directory removed"),
                Ok(false) => {}
                Err(e) => warn!(task = task_id, error = %e, "task directory not removed"),
            }
        }
        Ok(())
    }

    async fn cleanup_one(&self, ws: &WorkspaceRef, force: bool) -> Result<CleanupOutcome, GuardError> {
        if self.locks.freshness(&ws.path).is_fresh() {
            return Ok(CleanupOutcome::Refused("session lock is fresh".to_string()));
        }
        let canonical = canonical_for(self.canonicals, &ws.id.repo);
        let (reference, trunk) = self.inspector.workspace_reference(ws, canonical);
        let state = match self.inspector.inspect(&ws.path, reference.as_ref()) {
            Inspection::Known(state) => state,
            Inspection::Unknown { reason } => {
                return Err(GuardError::StateAmbiguous(format!("state unknown: {}", reason)));
            }
        };

        let at_risk = state.dirty || !state.head_is_durable();
        if at_risk && !force {
            let why = if state.dirty { "dirty" } else { "has unpushed commits" };
            return Ok(CleanupOutcome::Refused(format!("{}; rerun with --force to evacuate first", why)));
        }

        let name = ws.id.to_string();
        let mut preserved = Vec::new();
        let mut head_covered = state.head_is_durable();
        let permit = if state.dirty {
            let evacuation = self
                .evacuator
                .evacuate(&RescueTarget {
                    name: &name,
                    root: &ws.path,
                    trunk: &trunk,
                    reference: reference.as_ref(),
                    state: &state,
                })
                .await?;
            for branch in evacuation.branches() {
                if matches!(branch.kind, RescueKind::Branch | RescueKind::Commits) {
                    head_covered = true;
                }
                preserved.push(branch.name.clone());
            }
            Some(evacuation.permit().clone())
        } else {
            None
        };
        if !head_covered && let Some(pushed) = self.disposer.make_durable(ws, &state, &trunk).await? {
            preserved.push(pushed);
        }

        if !self.disposer.journal().is_dry_run() {
            if self.locks.freshness(&ws.path).is_fresh() {
                return Ok(CleanupOutcome::Refused("session lock appeared".to_string()));
            }
            self.recheck(ws, &state, reference.as_ref(), permit.as_ref())?;
        }

        self.disposer
            .dispose(ws, canonical, state.branch.as_deref(), &trunk, Disposal::Delete)
            .await?;
        Ok(CleanupOutcome::Removed { preserved })
    }

    /// Nothing may have changed since the evacuation (or, for a clean
    /// workspace, since inspection).
    fn recheck(
        &self,
        ws: &WorkspaceRef,
        before: &RepoState,
        reference: Option<&ReferenceBranch>,
        permit: Option<&ResetPermit>,
    ) -> Result<(), GuardError> {
        let now = match self.inspector.inspect(&ws.path, reference) {
            Inspection::Known(state) => state,
            Inspection::Unknown { reason } => {
                return Err(GuardError::TransientIo(format!("state unknown before removal: {}", reason)));
            }
        };
        match permit {
            Some(permit) => {
                let changes = if now.dirty { changed_paths(&ws.path)? } else { Vec::new() };
                permit.verify(&now, &changes)
            }
            None if now.dirty || now.head != before.head => Err(GuardError::InvariantViolation(format!(
                "{}: changed before removal",
                ws.id
            ))),
            None => Ok(()),
        }
    }
}
