//! Code-host adapter.
//!
//! Pull requests are read and mutated through the `gh` CLI, always with
//! `--json` output. Components depend on the [`CodeHost`] trait so the janitor
//! and queue enforcer can be tested without a network.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{CommandError, GuardError};
use crate::exec::{CommandRunner, Invocation, run_checked};

/// Fields requested from `gh pr list`.
pub const DEFAULT_PR_LIST_LIMIT: usize = 500;

pub const PR_JSON_FIELDS: &str =
    "number,state,headRefName,mergeStateStatus,mergeable,updatedAt,mergedAt,isDraft,autoMergeRequest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    #[default]
    Open,
    Closed,
    Merged,
}

/// GitHub's `mergeStateStatus`. Values this tool does not act on collapse to `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStateStatus {
    Behind,
    Blocked,
    Clean,
    Dirty,
    Draft,
    HasHooks,
    Unstable,
    #[default]
    Unknown,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A pull request as reported by the code host. Read-only on our side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRecord {
    pub number: u64,
    #[serde(default)]
    pub state: PrState,
    pub head_ref_name: String,
    #[serde(default)]
    pub merge_state_status: MergeStateStatus,
    #[serde(default)]
    pub mergeable: Mergeable,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_draft: bool,
    /// `null` when auto-merge is off
    #[serde(default)]
    pub auto_merge_request: Option<serde_json::Value>,
}

impl PullRequestRecord {
    pub fn auto_merge_enabled(&self) -> bool {
        self.auto_merge_request
            .as_ref()
            .is_some_and(|value| !value.is_null())
    }

    /// GitHub reports conflicts either as `mergeable: CONFLICTING` or as `DIRTY`.
    pub fn is_conflicting(&self) -> bool {
        self.mergeable == Mergeable::Conflicting
            || self.merge_state_status == MergeStateStatus::Dirty
    }

    pub fn is_behind(&self) -> bool {
        self.merge_state_status == MergeStateStatus::Behind
    }

    pub fn is_merged_or_closed(&self) -> bool {
        matches!(self.state, PrState::Merged | PrState::Closed)
    }
}

/// Pick the record that speaks for a branch: an open PR wins, otherwise the
/// most recently updated one.
pub fn select_for_branch(mut records: Vec<PullRequestRecord>) -> Option<PullRequestRecord> {
    if let Some(pos) = records.iter().position(|r| r.state == PrState::Open) {
        return Some(records.swap_remove(pos));
    }
    records.into_iter().max_by_key(|r| r.updated_at)
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    /// The PR associated with `branch`, in any state.
    async fn pr_for_branch(
        &self,
        repo_dir: &Path,
        branch: &str,
    ) -> Result<Option<PullRequestRecord>, GuardError>;

    async fn list_open(&self, repo_dir: &Path) -> Result<Vec<PullRequestRecord>, GuardError>;

    async fn create_draft(
        &self,
        repo_dir: &Path,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<(), GuardError>;

    async fn request_update(&self, repo_dir: &Path, number: u64) -> Result<(), GuardError>;

    async fn disable_auto_merge(&self, repo_dir: &Path, number: u64) -> Result<(), GuardError>;

    async fn close_and_delete_branch(&self, repo_dir: &Path, number: u64)
    -> Result<(), GuardError>;
}

/// `gh`-backed [`CodeHost`]. The repository is inferred by `gh` from the
/// working directory's remotes.
pub struct GhCli {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    list_limit: usize,
}

impl GhCli {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            list_limit: DEFAULT_PR_LIST_LIMIT,
        }
    }

    /// Cap on records per `gh pr list` call.
    pub fn with_list_limit(mut self, limit: usize) -> Self {
        self.list_limit = limit;
        self
    }

    fn invocation<I, S>(&self, repo_dir: &Path, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        Invocation::new("gh")
            .args(args)
            .cwd(repo_dir)
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .timeout(self.timeout)
    }

    async fn run(&self, invocation: Invocation) -> Result<String, GuardError> {
        let output = run_checked(self.runner.as_ref(), &invocation).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn list(&self, repo_dir: &Path, extra: &[&str]) -> Result<Vec<PullRequestRecord>, GuardError> {
        let limit = self.list_limit.to_string();
        let mut args = vec!["pr", "list", "--json", PR_JSON_FIELDS, "--limit", limit.as_str()];
        args.extend_from_slice(extra);
        let stdout = self.run(self.invocation(repo_dir, args)).await?;
        let records = parse_pr_list(&stdout)?;
        if records.len() >= self.list_limit {
            warn!(
                repo = %repo_dir.display(),
                limit = self.list_limit,
                "pull request listing hit its limit, older pull requests were not seen"
            );
        }
        Ok(records)
    }
}

/// Parse `gh pr list --json` output. Malformed JSON is a transient failure,
/// never an empty list, so callers do not act on a misread.
pub fn parse_pr_list(stdout: &str) -> Result<Vec<PullRequestRecord>, GuardError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| GuardError::TransientIo(format!("unparseable gh output: {}", e)))
}

#[async_trait]
impl CodeHost for GhCli {
    async fn pr_for_branch(
        &self,
        repo_dir: &Path,
        branch: &str,
    ) -> Result<Option<PullRequestRecord>, GuardError> {
        let records = self
            .list(repo_dir, &["--head", branch, "--state", "all"])
            .await?;
        Ok(select_for_branch(records))
    }

    async fn list_open(&self, repo_dir: &Path) -> Result<Vec<PullRequestRecord>, GuardError> {
        self.list(repo_dir, &["--state", "open"]).await
    }

    async fn create_draft(
        &self,
        repo_dir: &Path,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<(), GuardError> {
        self.run(self.invocation(
            repo_dir,
            [
                "pr", "create", "--draft", "--head", head, "--base", base, "--title", title,
                "--body", body,
            ],
        ))
        .await?;
        Ok(())
    }

    async fn request_update(&self, repo_dir: &Path, number: u64) -> Result<(), GuardError> {
        let number = number.to_string();
        self.run(self.invocation(repo_dir, ["pr", "update-branch", number.as_str()]))
            .await?;
        Ok(())
    }

    async fn disable_auto_merge(&self, repo_dir: &Path, number: u64) -> Result<(), GuardError> {
        let number = number.to_string();
        self.run(self.invocation(repo_dir, ["pr", "merge", number.as_str(), "--disable-auto"]))
            .await?;
        Ok(())
    }

    async fn close_and_delete_branch(
        &self,
        repo_dir: &Path,
        number: u64,
    ) -> Result<(), GuardError> {
        let number = number.to_string();
        self.run(self.invocation(
            repo_dir,
            ["pr", "close", number.as_str(), "--delete-branch"],
        ))
        .await?;
        Ok(())
    }
}

/// Confirm `gh` is installed. Missing tools are a configuration error.
pub async fn ensure_available(runner: &dyn CommandRunner) -> Result<(), GuardError> {
    match run_checked(runner, &Invocation::new("gh").arg("--version")).await {
        Ok(_) => Ok(()),
        Err(err @ CommandError::NotFound { .. }) => Err(err.into()),
        Err(other) => Err(GuardError::Configuration(other.to_string())),
    }
}
