use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::{Action, ActionJournal};
use crate::errors::GuardError;
use crate::git::GitCli;
use crate::inspector::RepoState;
use crate::layout::{CanonicalRepository, WorkspaceId, WorkspaceRef, is_linked_worktree};
use crate::rescue::rescue_branch_name;
use crate::util::compact_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Delete,
    /// Compress to the archive directory, then delete
    Archive,
}

/// `<task-id>--<repo>--<UTC timestamp>.tar.gz`
pub fn archive_file_name(id: &WorkspaceId, at: DateTime<Utc>) -> String {
    format!("{}--{}--{}.tar.gz", id.task_id, id.repo, compact_timestamp(at))
}

/// Removes workspaces. Shared by GC and explicit task cleanup.
pub struct WorkspaceDisposer<'a> {
    git: &'a GitCli,
    journal: &'a ActionJournal,
    host: &'a str,
    archive_dir: &'a Path,
}

impl<'a> WorkspaceDisposer<'a> {
    pub fn new(git: &'a GitCli, journal: &'a ActionJournal, host: &'a str, archive_dir: &'a Path) -> Self {
        Self {
            git,
            journal,
            host,
            archive_dir,
        }
    }

    pub fn journal(&self) -> &ActionJournal {
        self.journal
    }

    /// Push HEAD if the remote does not already have it. A named branch is
    /// pushed under its own name; trunk or a detached HEAD goes to a rescue
    /// branch. Returns the remote branch that now holds HEAD, if a push ran.
    pub async fn make_durable(
        &self,
        ws: &WorkspaceRef,
        state: &RepoState,
        trunk: &str,
    ) -> Result<Option<String>, GuardError> {
        if state.head_is_durable() {
            return Ok(None);
        }
        let target = ws.id.to_string();

        match state.branch.as_deref() {
            Some(branch) if branch != trunk => {
                let record = self.journal.plan(
                    &target,
                    Action::PushBranch,
                    Some(format!("{} unpushed commit(s) on {}", state.ahead, branch)),
                );
                if !self.journal.is_dry_run() {
                    self.journal
                        .settle(record, self.git.push_branch(&ws.path, branch).await)?;
                }
                Ok(Some(branch.to_string()))
            }
            _ => {
                let name = format!("{}-commits", rescue_branch_name(self.host, &target, Utc::now()));
                let record = self.journal.plan(
                    &target,
                    Action::RescuePush,
                    Some(format!("{} unpushed commit(s) as {}", state.ahead, name)),
                );
                if !self.journal.is_dry_run() {
                    self.journal
                        .settle(record, self.git.push_head_as(&ws.path, &name).await)?;
                }
                Ok(Some(name))
            }
        }
    }

    /// Archive (optionally) and remove a workspace, then drop its local
    /// branch from the canonical repository when it was a linked worktree.
    /// Returns the archive path when one was written or planned.
    pub async fn dispose(
        &self,
        ws: &WorkspaceRef,
        canonical: Option<&CanonicalRepository>,
        branch: Option<&str>,
        trunk: &str,
        disposal: Disposal,
    ) -> Result<Option<PathBuf>, GuardError> {
        let target = ws.id.to_string();
        let dry_run = self.journal.is_dry_run();

        let archive = match disposal {
            Disposal::Archive => {
                let path = self.archive_dir.join(archive_file_name(&ws.id, Utc::now()));
                let record = self
                    .journal
                    .plan(&target, Action::Archive, Some(path.display().to_string()));
                if !dry_run {
                    self.journal
                        .settle(record, self.git.archive(&ws.path, &path).await)?;
                }
                Some(path)
            }
            Disposal::Delete => None,
        };

        let owner = canonical.filter(|_| is_linked_worktree(&ws.path));
        let record = self
            .journal
            .plan(&target, Action::Delete, Some(ws.path.display().to_string()));
        if dry_run {
            return Ok(archive);
        }
        self.journal.settle(record, self.remove(ws, owner).await)?;
        info!(workspace = %target, archived = archive.is_some(), "workspace removed");

        if let (Some(owner), Some(branch)) = (owner, branch)
            && branch != trunk
        {
            let record = self
                .journal
                .plan(&target, Action::Delete, Some(format!("local branch {}", branch)));
            if let Err(e) = self
                .journal
                .settle(record, self.git.delete_branch(&owner.root, branch, false).await)
            {
                warn!(branch, error = %e, "local branch kept");
            }
        }
        Ok(archive)
    }

    async fn remove(&self, ws: &WorkspaceRef, owner: Option<&CanonicalRepository>) -> Result<(), GuardError> {
        match owner {
            Some(owner) => {
                self.git.worktree_remove(&owner.root, &ws.path).await?;
                if let Err(e) = self.git.worktree_prune(&owner.root).await {
                    warn!(repo = %owner.name, error = %e, "worktree prune failed");
                }
            }
            None => tokio::fs::remove_dir_all(&ws.path).await?,
        }
        Ok(())
    }
}
