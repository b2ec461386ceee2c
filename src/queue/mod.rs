//! QueueHygieneEnforcer: keep the merge queue moving.
//!
//! Runs only on the leader host. Each open pull request gets at most one
//! action per run, chosen by [`decide`].

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{Action, ActionJournal};
use crate::errors::GuardError;
use crate::git::GitCli;
use crate::github::{CodeHost, PullRequestRecord};
use crate::inspector::{Inspector, ReferenceBranch, discover_trunk, remote_branch_ahead};
use crate::layout::CanonicalRepository;
use crate::report::{ItemOutcome, RunReport};
use crate::util::hours_between;

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    update_after_hours: i64,
    stuck_after_hours: i64,
    rescue_patterns: Vec<Regex>,
}

impl QueuePolicy {
    pub fn new(
        update_after_hours: u64,
        stuck_after_hours: u64,
        rescue_patterns: &[String],
    ) -> Result<Self, GuardError> {
        let rescue_patterns = rescue_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    GuardError::Configuration(format!(
                        "invalid rescue branch pattern '{}': {}",
                        pattern, e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            update_after_hours: update_after_hours as i64,
            stuck_after_hours: stuck_after_hours as i64,
            rescue_patterns,
        })
    }

    pub fn is_rescue_branch(&self, branch: &str) -> bool {
        self.rescue_patterns.iter().any(|re| re.is_match(branch))
    }

    pub fn update_after_hours(&self) -> i64 {
        self.update_after_hours
    }

    pub fn stuck_after_hours(&self) -> i64 {
        self.stuck_after_hours
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    /// Rescue branch that carries nothing trunk lacks
    CloseEmptyRescue,
    DisableConflicting,
    DisableStuck,
    RequestUpdate,
    None,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::CloseEmptyRescue => "close_empty_rescue",
            QueueAction::DisableConflicting => "disable_auto_merge_conflicting",
            QueueAction::DisableStuck => "disable_auto_merge_stuck",
            QueueAction::RequestUpdate => "request_update",
            QueueAction::None => "none",
        }
    }
}

/// First matching rule wins. `ahead` is the head branch's commit count past
/// trunk; `None` (unknown) never closes anything.
pub fn decide(
    pr: &PullRequestRecord,
    ahead: Option<usize>,
    policy: &QueuePolicy,
    now: DateTime<Utc>,
) -> QueueAction {
    if policy.is_rescue_branch(&pr.head_ref_name) && ahead == Some(0) {
        return QueueAction::CloseEmptyRescue;
    }
    if !pr.auto_merge_enabled() {
        return QueueAction::None;
    }
    let idle = now - pr.updated_at;
    if pr.is_conflicting() {
        return QueueAction::DisableConflicting;
    }
    if pr.is_behind() && idle > TimeDelta::hours(policy.stuck_after_hours) {
        return QueueAction::DisableStuck;
    }
    if pr.is_behind() && idle > TimeDelta::hours(policy.update_after_hours) {
        return QueueAction::RequestUpdate;
    }
    QueueAction::None
}

pub struct QueueHygieneEnforcer<'a> {
    policy: &'a QueuePolicy,
    code_host: &'a dyn CodeHost,
    git: &'a GitCli,
    inspector: &'a Inspector,
    journal: &'a ActionJournal,
}

impl<'a> QueueHygieneEnforcer<'a> {
    pub fn new(
        policy: &'a QueuePolicy,
        code_host: &'a dyn CodeHost,
        git: &'a GitCli,
        inspector: &'a Inspector,
        journal: &'a ActionJournal,
    ) -> Self {
        Self {
            policy,
            code_host,
            git,
            inspector,
            journal,
        }
    }

    pub async fn run(&self, repos: &[CanonicalRepository], report: &mut RunReport, now: DateTime<Utc>) {
        for repo in repos {
            let reference = self.refresh(repo).await;
            let open = match self.code_host.list_open(&repo.root).await {
                Ok(open) => open,
                Err(e) => {
                    report.fail(&repo.name, None, &e);
                    continue;
                }
            };
            info!(repo = %repo.name, open = open.len(), "enforcing queue hygiene");

            for pr in &open {
                let target = format!("{}#{}", repo.name, pr.number);
                let ahead = match &reference {
                    Some(reference) if self.policy.is_rescue_branch(&pr.head_ref_name) => {
                        remote_branch_ahead(&repo.root, &pr.head_ref_name, reference)
                    }
                    _ => None,
                };
                let action = decide(pr, ahead, self.policy, now);
                if action == QueueAction::None {
                    report.record(&target, ItemOutcome::Noop, None, None);
                    continue;
                }
                let detail = format!(
                    "{} ({:?}, idle {}h)",
                    pr.head_ref_name,
                    pr.merge_state_status,
                    hours_between(pr.updated_at, now)
                );
                match self.apply(repo, pr, action, &target, &detail).await {
                    Ok(()) => {
                        let outcome = if self.journal.is_dry_run() {
                            ItemOutcome::Planned
                        } else {
                            ItemOutcome::Acted
                        };
                        report.record(&target, outcome, Some(action.as_str()), Some(detail));
                    }
                    Err(e) => report.fail(&target, Some(action.as_str()), &e),
                }
            }
        }
    }

    /// Fetch so remote-tracking refs match the host's view, then resolve the
    /// trunk reference. A failed fetch leaves ahead counts unknown.
    async fn refresh(&self, repo: &CanonicalRepository) -> Option<ReferenceBranch> {
        let record = self.journal.plan(&repo.name, Action::Fetch, None);
        if !self.journal.is_dry_run() {
            if let Err(e) = self.journal.settle(record, self.git.fetch(&repo.root).await) {
                warn!(repo = %repo.name, error = %e, "fetch failed, rescue PRs will not be closed");
                return None;
            }
            self.inspector.forget(&repo.name);
        }
        let trunk = discover_trunk(&repo.root, repo.trunk.as_deref());
        self.inspector.reference_for(&repo.name, &repo.root, Some(&trunk))
    }

    async fn apply(
        &self,
        repo: &CanonicalRepository,
        pr: &PullRequestRecord,
        action: QueueAction,
        target: &str,
        detail: &str,
    ) -> Result<(), GuardError> {
        let journal_action = match action {
            QueueAction::CloseEmptyRescue => Action::PrClose,
            QueueAction::DisableConflicting | QueueAction::DisableStuck => Action::PrDisableAutoMerge,
            QueueAction::RequestUpdate => Action::PrUpdateBranch,
            QueueAction::None => return Ok(()),
        };
        let record = self.journal.plan(target, journal_action, Some(detail.to_string()));
        if self.journal.is_dry_run() {
            return Ok(());
        }
        let result = match action {
            QueueAction::CloseEmptyRescue => self.code_host.close_and_delete_branch(&repo.root, pr.number).await,
            QueueAction::DisableConflicting | QueueAction::DisableStuck => {
                self.code_host.disable_auto_merge(&repo.root, pr.number).await
            }
            QueueAction::RequestUpdate => self.code_host.request_update(&repo.root, pr.number).await,
            QueueAction::None => Ok(()),
        };
        self.journal.settle(record, result)
    }
}
