//! DurabilityJanitor: make sure work sitting in task workspaces exists on the
//! remote, and is visible as a draft pull request.
//!
//! Draft creation is rate limited by a per-run budget. Candidates over the
//! budget are reported as deferred and picked up by the next run.

use tracing::{debug, info, warn};

use crate::audit::{Action, ActionJournal};
use crate::errors::GuardError;
use crate::git::GitCli;
use crate::github::{CodeHost, PrState, PullRequestRecord};
use crate::inspector::{Inspection, Inspector, RepoState};
use crate::layout::{CanonicalRepository, WorkspaceRef, canonical_for, discover_workspaces};
use crate::report::{ItemOutcome, RunReport};

/// Deterministic draft title for a branch.
pub fn draft_title(branch: &str) -> String {
    format!("draft: {}", branch)
}

fn draft_body(ws: &WorkspaceRef, branch: &str, host: &str) -> String {
    format!(
        "Automated draft keeping `{}` durable.\n\nworkspace: {}\nhost: {}\n",
        branch, ws.id, host
    )
}

/// Per-run cap on draft pull request creation.
#[derive(Debug, Clone, Copy)]
pub struct PrBudget {
    limit: usize,
    used: usize,
}

impl PrBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Claim one creation slot, if any are left.
    pub fn try_take(&mut self) -> bool {
        if self.used < self.limit {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot whose creation failed.
    pub fn give_back(&mut self) {
        self.used = self.used.saturating_sub(1);
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrStep {
    /// An open PR already exists
    Exists(u64),
    Created,
    /// Over budget this run
    Deferred,
    /// The branch's latest PR was closed without merging
    Rejected(u64),
    /// Merged, and nothing committed since
    AlreadyMerged(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JanitorOutcome {
    /// Nothing ahead of trunk
    Inert,
    /// Commits on trunk or a detached HEAD: no branch to publish
    NoBranch,
    Handled { pushed: bool, pr: PrStep },
}

impl JanitorOutcome {
    fn item_outcome(&self, dry_run: bool) -> ItemOutcome {
        match self {
            JanitorOutcome::Inert => ItemOutcome::Noop,
            JanitorOutcome::NoBranch => ItemOutcome::Skipped,
            JanitorOutcome::Handled { pr: PrStep::Deferred, .. } => ItemOutcome::Deferred,
            JanitorOutcome::Handled { pushed, pr } => {
                let acted = *pushed || *pr == PrStep::Created;
                match (acted, dry_run) {
                    (false, _) => ItemOutcome::Noop,
                    (true, true) => ItemOutcome::Planned,
                    (true, false) => ItemOutcome::Acted,
                }
            }
        }
    }

    fn detail(&self) -> Option<String> {
        let JanitorOutcome::Handled { pushed, pr } = self else {
            return match self {
                JanitorOutcome::NoBranch => Some("unpushed commits without a branch".into()),
                _ => None,
            };
        };
        let pr = match pr {
            PrStep::Exists(n) => format!("PR #{} open", n),
            PrStep::Created => "draft PR created".to_string(),
            PrStep::Deferred => "draft PR deferred, budget exhausted".to_string(),
            PrStep::Rejected(n) => format!("PR #{} closed unmerged, not reopening", n),
            PrStep::AlreadyMerged(n) => format!("PR #{} merged", n),
        };
        Some(if *pushed { format!("pushed; {}", pr) } else { pr })
    }
}

pub struct DurabilityJanitor<'a> {
    canonicals: &'a [CanonicalRepository],
    inspector: &'a Inspector,
    git: &'a GitCli,
    code_host: &'a dyn CodeHost,
    journal: &'a ActionJournal,
    host: &'a str,
}

impl<'a> DurabilityJanitor<'a> {
    pub fn new(
        canonicals: &'a [CanonicalRepository],
        inspector: &'a Inspector,
        git: &'a GitCli,
        code_host: &'a dyn CodeHost,
        journal: &'a ActionJournal,
        host: &'a str,
    ) -> Self {
        Self {
            canonicals,
            inspector,
            git,
            code_host,
            journal,
            host,
        }
    }

    pub async fn run(&self, workspace_root: &std::path::Path, budget: &mut PrBudget, report: &mut RunReport) {
        for ws in discover_workspaces(workspace_root) {
            let target = ws.id.to_string();
            match self.ensure_durable(&ws, budget).await {
                Ok(outcome) => {
                    let label = match &outcome {
                        JanitorOutcome::Inert => "inert",
                        JanitorOutcome::NoBranch => "no_branch",
                        JanitorOutcome::Handled { .. } => "durable",
                    };
                    report.record(
                        &target,
                        outcome.item_outcome(self.journal.is_dry_run()),
                        Some(label),
                        outcome.detail(),
                    );
                }
                Err(e) => report.fail(&target, None, &e),
            }
        }
        info!(created = budget.used(), deferred = report.counts.deferred_prs, "janitor finished");
    }

    pub async fn ensure_durable(
        &self,
        ws: &WorkspaceRef,
        budget: &mut PrBudget,
    ) -> Result<JanitorOutcome, GuardError> {
        let canonical = canonical_for(self.canonicals, &ws.id.repo);
        let (reference, trunk) = self.inspector.workspace_reference(ws, canonical);
        let state = match self.inspector.inspect(&ws.path, reference.as_ref()) {
            Inspection::Known(state) => state,
            Inspection::Unknown { reason } => {
                return Err(GuardError::TransientIo(format!("state unknown: {}", reason)));
            }
        };

        if state.ahead == 0 {
            return Ok(JanitorOutcome::Inert);
        }
        let branch = match state.branch.as_deref() {
            Some(branch) if branch != trunk => branch.to_string(),
            _ => {
                debug!(workspace = %ws.id, "ahead of trunk without a feature branch");
                return Ok(JanitorOutcome::NoBranch);
            }
        };

        let pushed = self.push_if_needed(ws, &state, &branch).await?;

        let existing = self.code_host.pr_for_branch(&ws.path, &branch).await?;
        let pr = match existing.as_ref().and_then(|pr| already_covered(pr, &state)) {
            Some(step) => step,
            None if budget.try_take() => {
                if let Err(e) = self.create_draft(ws, &branch, &trunk).await {
                    budget.give_back();
                    return Err(e);
                }
                PrStep::Created
            }
            None => {
                warn!(workspace = %ws.id, branch = %branch, "draft PR deferred, budget exhausted");
                PrStep::Deferred
            }
        };
        Ok(JanitorOutcome::Handled { pushed, pr })
    }

    /// Push when there is no upstream or the upstream is behind. Never forces.
    async fn push_if_needed(&self, ws: &WorkspaceRef, state: &RepoState, branch: &str) -> Result<bool, GuardError> {
        if state.has_upstream && state.upstream_ahead == Some(0) {
            return Ok(false);
        }
        let detail = match state.upstream_ahead {
            Some(n) if state.has_upstream => format!("{} commit(s) ahead of upstream", n),
            _ => "no upstream".to_string(),
        };
        let record = self
            .journal
            .plan(&ws.id.to_string(), Action::PushBranch, Some(format!("{}: {}", branch, detail)));
        if !self.journal.is_dry_run() {
            self.journal
                .settle(record, self.git.push_branch(&ws.path, branch).await)?;
        }
        Ok(true)
    }

    async fn create_draft(&self, ws: &WorkspaceRef, branch: &str, trunk: &str) -> Result<(), GuardError> {
        let title = draft_title(branch);
        let record = self.journal.plan(
            &ws.id.to_string(),
            Action::PrCreate,
            Some(format!("'{}' {} -> {}", title, branch, trunk)),
        );
        if self.journal.is_dry_run() {
            return Ok(());
        }
        let body = draft_body(ws, branch, self.host);
        self.journal.settle(
            record,
            self.code_host
                .create_draft(&ws.path, branch, trunk, &title, &body)
                .await,
        )
    }
}

/// Whether an existing PR already speaks for the branch. A merged PR only
/// covers the branch if nothing was committed after the merge.
fn already_covered(pr: &PullRequestRecord, state: &RepoState) -> Option<PrStep> {
    match pr.state {
        PrState::Open => Some(PrStep::Exists(pr.number)),
        PrState::Closed => Some(PrStep::Rejected(pr.number)),
        PrState::Merged => {
            let newer_work = match (state.last_commit_at, pr.merged_at) {
                (Some(commit), Some(merged)) => commit > merged,
                _ => false,
            };
            (!newer_work).then_some(PrStep::AlreadyMerged(pr.number))
        }
    }
}
