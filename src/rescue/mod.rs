//! RescueEvacuator: move at-risk local state onto a pushed branch before any
//! destructive reset.
//!
//! The one rule everything here serves: a reset may only follow a successful
//! push of everything it would destroy. Evacuation hands back a
//! [`ResetPermit`]; the reconciler cannot reset without one, and the permit is
//! re-checked against a fresh inspection immediately before the reset.

mod naming;

pub use naming::{RESCUE_PREFIX, correlation_key, rescue_branch_name, rescue_commit_message};

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use git2::{ObjectType, Oid};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{Action, ActionJournal};
use crate::errors::GuardError;
use crate::git::GitCli;
use crate::inspector::{
    ChangedPath, ReferenceBranch, RepoState, changed_paths, local_branch_ahead, local_branch_tip,
};

/// What needs evacuating, as seen by the caller's inspection.
#[derive(Debug, Clone)]
pub struct RescueTarget<'a> {
    /// Repository name, or `task/repo` for a workspace
    pub name: &'a str,
    pub root: &'a Path,
    pub trunk: &'a str,
    pub reference: Option<&'a ReferenceBranch>,
    pub state: &'a RepoState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescueKind {
    /// Uncommitted working-tree content, committed onto trunk in a scratch worktree
    WorkingTree,
    /// Local commits only reachable from a branch the reset will move
    Commits,
    /// Commits on the local trunk branch while HEAD is elsewhere
    TrunkCommits,
    /// Off-trunk branch pushed under its own name, best effort
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescueBranch {
    pub name: String,
    pub kind: RescueKind,
    pub paths: usize,
}

/// Proof that the state a reset will destroy has been pushed.
///
/// Only constructed by [`RescueEvacuator::evacuate`].
#[derive(Debug, Clone)]
pub struct ResetPermit {
    root: PathBuf,
    head: Option<Oid>,
    /// Changed paths and the blob id of the content that was preserved;
    /// `None` for a path that was absent
    covered: BTreeMap<PathBuf, Option<Oid>>,
    /// Local trunk name and tip when HEAD is on another branch
    trunk: Option<(String, Option<Oid>)>,
}

impl ResetPermit {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check a fresh inspection against what was evacuated. New dirty paths,
    /// content edited since it was copied, or a moved HEAD or local trunk
    /// mean the reset would destroy unrescued work.
    pub fn verify(&self, state: &RepoState, changes: &[ChangedPath]) -> Result<(), GuardError> {
        if state.head != self.head {
            return Err(GuardError::InvariantViolation(format!(
                "{}: HEAD moved after evacuation",
                self.root.display()
            )));
        }
        if let Some((trunk, tip)) = &self.trunk
            && local_branch_tip(&self.root, trunk)? != *tip
        {
            return Err(GuardError::InvariantViolation(format!(
                "{}: local {} moved after evacuation",
                self.root.display(),
                trunk
            )));
        }
        let mut uncovered = Vec::new();
        for change in changes {
            let preserved = match self.covered.get(&change.path) {
                Some(id) => content_id(&self.root.join(&change.path))? == *id,
                None => false,
            };
            if !preserved {
                uncovered.push(change.path.display().to_string());
            }
        }
        if !uncovered.is_empty() {
            return Err(GuardError::InvariantViolation(format!(
                "{}: {} path(s) changed after evacuation: {}",
                self.root.display(),
                uncovered.len(),
                uncovered.join(", ")
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Evacuation {
    /// Clean and on trunk with nothing unpushed
    NoOpIfClean(ResetPermit),
    Rescued {
        branches: Vec<RescueBranch>,
        permit: ResetPermit,
    },
}

impl Evacuation {
    pub fn permit(&self) -> &ResetPermit {
        match self {
            Evacuation::NoOpIfClean(permit) | Evacuation::Rescued { permit, .. } => permit,
        }
    }

    pub fn branches(&self) -> &[RescueBranch] {
        match self {
            Evacuation::NoOpIfClean(_) => &[],
            Evacuation::Rescued { branches, .. } => branches,
        }
    }
}

pub struct RescueEvacuator<'a> {
    git: &'a GitCli,
    journal: &'a ActionJournal,
    host: &'a str,
    scratch_dir: &'a Path,
}

impl<'a> RescueEvacuator<'a> {
    /// `scratch_dir` holds the temporary worktrees.
    pub fn new(git: &'a GitCli, journal: &'a ActionJournal, host: &'a str, scratch_dir: &'a Path) -> Self {
        Self {
            git,
            journal,
            host,
            scratch_dir,
        }
    }

    /// Evacuate everything a trunk reset of `target` would destroy.
    ///
    /// Returns `Err` when any required push fails; the source repository is
    /// then left exactly as found.
    pub async fn evacuate(&self, target: &RescueTarget<'_>) -> Result<Evacuation, GuardError> {
        let state = target.state;
        let on_trunk = state.is_on(target.trunk);
        let changes = if state.dirty {
            changed_paths(target.root)?
        } else {
            Vec::new()
        };
        let mut covered = BTreeMap::new();
        for change in &changes {
            covered.insert(change.path.clone(), content_id(&target.root.join(&change.path))?);
        }
        // The checkout moves the local trunk ref, so its own unpushed commits
        // are at risk whenever HEAD is elsewhere.
        let local_trunk = if on_trunk {
            None
        } else {
            local_branch_ahead(target.root, target.trunk, target.reference)?
        };
        let trunk_tip = (!on_trunk).then(|| (target.trunk.to_string(), local_trunk.map(|(tip, _)| tip)));
        let trunk_ahead = local_trunk.map_or(0, |(_, ahead)| ahead);

        if !state.dirty && on_trunk && state.ahead == 0 {
            return Ok(Evacuation::NoOpIfClean(ResetPermit {
                root: target.root.to_path_buf(),
                head: state.head,
                covered,
                trunk: trunk_tip,
            }));
        }

        let base_name = rescue_branch_name(self.host, target.name, Utc::now());
        let mut branches = Vec::new();

        if state.ahead > 0 {
            match (&state.branch, on_trunk) {
                (Some(branch), false) => {
                    // The local ref survives the reset, so this push is best effort.
                    if state.upstream_ahead != Some(0) && self.push_own_branch(target, branch).await
                    {
                        branches.push(RescueBranch {
                            name: branch.clone(),
                            kind: RescueKind::Branch,
                            paths: 0,
                        });
                    }
                }
                _ => {
                    let name = format!("{}-commits", base_name);
                    self.push_commits(target, &name).await?;
                    branches.push(RescueBranch {
                        name,
                        kind: RescueKind::Commits,
                        paths: 0,
                    });
                }
            }
        }

        if trunk_ahead > 0 {
            let name = format!("{}-trunk-commits", base_name);
            self.push_trunk_commits(target, &name, trunk_ahead).await?;
            branches.push(RescueBranch {
                name,
                kind: RescueKind::TrunkCommits,
                paths: 0,
            });
        }

        let to_copy: Vec<&ChangedPath> = changes.iter().filter(|c| c.needs_copy()).collect();
        if !to_copy.is_empty() {
            let copied = self.rescue_working_tree(target, &base_name, &to_copy).await?;
            covered.extend(copied);
            branches.push(RescueBranch {
                name: base_name,
                kind: RescueKind::WorkingTree,
                paths: to_copy.len(),
            });
        }

        let permit = ResetPermit {
            root: target.root.to_path_buf(),
            head: state.head,
            covered,
            trunk: trunk_tip,
        };
        if branches.is_empty() {
            return Ok(Evacuation::NoOpIfClean(permit));
        }
        Ok(Evacuation::Rescued { branches, permit })
    }

    async fn push_own_branch(&self, target: &RescueTarget<'_>, branch: &str) -> bool {
        let record = self.journal.plan(
            target.name,
            Action::PushBranch,
            Some(format!("{} commit(s) on {}", target.state.ahead, branch)),
        );
        if self.journal.is_dry_run() {
            return true;
        }
        match self.git.push_branch(target.root, branch).await {
            Ok(()) => {
                self.journal.succeeded(record);
                true
            }
            Err(e) => {
                warn!(repo = target.name, branch, error = %e, "best-effort branch push failed");
                self.journal.failed(record, &e.to_string());
                false
            }
        }
    }

    /// Commits reachable only from trunk or a detached HEAD are lost by the
    /// reset, so this push blocks it.
    async fn push_commits(&self, target: &RescueTarget<'_>, name: &str) -> Result<(), GuardError> {
        let record = self.journal.plan(
            target.name,
            Action::RescuePush,
            Some(format!("{} unpushed commit(s) as {}", target.state.ahead, name)),
        );
        if self.journal.is_dry_run() {
            return Ok(());
        }
        match self.git.push_head_as(target.root, name).await {
            Ok(()) => {
                self.journal.succeeded(record);
                info!(repo = target.name, branch = name, "pushed unpushed commits");
                Ok(())
            }
            Err(e) => {
                self.journal.failed(record, &e.to_string());
                Err(e)
            }
        }
    }

    /// Blocking: the trunk checkout would leave these commits unreachable.
    async fn push_trunk_commits(
        &self,
        target: &RescueTarget<'_>,
        name: &str,
        ahead: usize,
    ) -> Result<(), GuardError> {
        let record = self.journal.plan(
            target.name,
            Action::RescuePush,
            Some(format!("{} unpushed commit(s) on local {} as {}", ahead, target.trunk, name)),
        );
        if self.journal.is_dry_run() {
            return Ok(());
        }
        match self.git.push_branch_as(target.root, target.trunk, name).await {
            Ok(()) => {
                self.journal.succeeded(record);
                info!(repo = target.name, branch = name, "pushed local trunk commits");
                Ok(())
            }
            Err(e) => {
                self.journal.failed(record, &e.to_string());
                Err(e)
            }
        }
    }

    /// Returns the blob id of every copied path as it was committed.
    async fn rescue_working_tree(
        &self,
        target: &RescueTarget<'_>,
        branch: &str,
        paths: &[&ChangedPath],
    ) -> Result<BTreeMap<PathBuf, Option<Oid>>, GuardError> {
        let record = self.journal.plan(
            target.name,
            Action::RescuePush,
            Some(format!("{} changed path(s) as {}", paths.len(), branch)),
        );
        if self.journal.is_dry_run() {
            return Ok(BTreeMap::new());
        }

        let scratch = self.scratch_dir.join(branch);
        let start = target
            .reference
            .map(|r| r.oid.to_string())
            .unwrap_or_else(|| "HEAD".to_string());

        let result = self
            .commit_and_push(target, branch, &scratch, &start, paths)
            .await;
        self.discard_scratch(target.root, &scratch, branch).await;

        match result {
            Ok(copied) => {
                self.journal.succeeded(record);
                info!(repo = target.name, branch, paths = paths.len(), "rescue branch pushed");
                Ok(copied)
            }
            Err(e) => {
                self.journal.failed(record, &e.to_string());
                Err(e)
            }
        }
    }

    async fn commit_and_push(
        &self,
        target: &RescueTarget<'_>,
        branch: &str,
        scratch: &Path,
        start: &str,
        paths: &[&ChangedPath],
    ) -> Result<BTreeMap<PathBuf, Option<Oid>>, GuardError> {
        fs::create_dir_all(self.scratch_dir)?;
        if scratch.exists() {
            fs::remove_dir_all(scratch)?;
            let _ = self.git.worktree_prune(target.root).await;
        }

        self.git.worktree_add(target.root, scratch, branch, start).await?;
        let copied = copy_paths(target.root, scratch, paths)?;
        let message = rescue_commit_message(
            target.name,
            target.state.branch.as_deref(),
            self.host,
            paths.len(),
        );
        self.git.commit_all(scratch, &message).await?;
        self.git.push_head_as(scratch, branch).await?;
        Ok(copied)
    }

    /// Remove the scratch worktree and its local branch. Failures only warn:
    /// the pushed branch is what matters, and leftovers are pruned next time.
    async fn discard_scratch(&self, root: &Path, scratch: &Path, branch: &str) {
        if scratch.exists()
            && let Err(e) = self.git.worktree_remove(root, scratch).await
        {
            warn!(path = %scratch.display(), error = %e, "scratch worktree removal failed");
            let _ = fs::remove_dir_all(scratch);
        }
        let _ = self.git.worktree_prune(root).await;
        if let Err(e) = self.git.delete_branch(root, branch, true).await {
            warn!(branch, error = %e, "local rescue branch not deleted");
        }
    }
}

/// Copy each changed path's current content from `from` to `to`, keeping the
/// directory structure. Symlinks are recreated, not followed. Returns the blob
/// id of what landed in `to`.
fn copy_paths(
    from: &Path,
    to: &Path,
    paths: &[&ChangedPath],
) -> Result<BTreeMap<PathBuf, Option<Oid>>, GuardError> {
    let mut copied = BTreeMap::new();
    for change in paths {
        let source = from.join(&change.path);
        let dest = to.join(&change.path);
        let metadata = match fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            // Vanished since enumeration: nothing left to preserve.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                copied.insert(change.path.clone(), None);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if metadata.file_type().is_symlink() {
            let link = fs::read_link(&source)?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(link, &dest)?;
        } else if metadata.is_file() {
            fs::copy(&source, &dest)?;
        } else {
            warn!(path = %source.display(), "skipping non-file path during rescue");
            continue;
        }
        copied.insert(change.path.clone(), content_id(&dest)?);
    }
    Ok(copied)
}

/// Blob id of a path's content as git would store it; a symlink hashes its
/// target. `None` when nothing is there.
fn content_id(path: &Path) -> Result<Option<Oid>, GuardError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if metadata.file_type().is_symlink() {
        let link = fs::read_link(path)?;
        Ok(Some(Oid::hash_object(ObjectType::Blob, link.as_os_str().as_bytes())?))
    } else if metadata.is_file() {
        Ok(Some(Oid::hash_file(ObjectType::Blob, path)?))
    } else {
        Ok(None)
    }
}
