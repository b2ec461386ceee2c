//! Read-only repository facts.
//!
//! Everything the decision logic needs is produced here from `git2`, never by
//! parsing porcelain text: branch, dirtiness, ahead/behind against a reference
//! branch, upstream presence and last-commit time. Failures become
//! [`Inspection::Unknown`] so callers can pick their most conservative branch.

mod status;

pub use status::{ChangeKind, ChangedPath, changed_paths};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use git2::{BranchType, ErrorCode, Oid, Repository, StatusOptions};
use serde::Serialize;

use crate::layout::{CanonicalRepository, WorkspaceRef, is_linked_worktree};
use crate::lock::is_lock_artifact;

pub const REMOTE: &str = "origin";
const DEFAULT_TRUNK_CANDIDATES: [&str; 2] = ["master", "main"];

/// The remote-tracking ref ahead/behind counts are computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceBranch {
    /// Short trunk name, e.g. `master`
    pub trunk: String,
    #[serde(skip)]
    pub oid: Oid,
}

impl ReferenceBranch {
    /// `origin/<trunk>`
    pub fn remote_name(&self) -> String {
        format!("{}/{}", REMOTE, self.trunk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoState {
    /// `None` when HEAD is detached
    pub branch: Option<String>,
    #[serde(skip)]
    pub head: Option<Oid>,
    pub dirty: bool,
    pub ahead: usize,
    pub behind: usize,
    pub has_upstream: bool,
    /// Commits not yet on the branch's own upstream
    pub upstream_ahead: Option<usize>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub reference: Option<String>,
}

impl RepoState {
    pub fn is_on(&self, trunk: &str) -> bool {
        self.branch.as_deref() == Some(trunk)
    }

    /// HEAD is already on the remote, via trunk or the branch's upstream.
    pub fn head_is_durable(&self) -> bool {
        self.ahead == 0 || self.upstream_ahead == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Known(RepoState),
    Unknown { reason: String },
}

impl Inspection {
    pub fn known(&self) -> Option<&RepoState> {
        match self {
            Inspection::Known(state) => Some(state),
            Inspection::Unknown { .. } => None,
        }
    }
}

/// Inspects repositories, resolving each repository's reference branch only
/// once per run so every decision in that run sees the same trunk head.
#[derive(Debug, Default)]
pub struct Inspector {
    references: Mutex<HashMap<String, Option<ReferenceBranch>>>,
}

impl Inspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached reference for `key` (a canonical repository name), resolved
    /// from `path` on first use.
    pub fn reference_for(
        &self,
        key: &str,
        path: &Path,
        preferred_trunk: Option<&str>,
    ) -> Option<ReferenceBranch> {
        let mut cache = match self.references.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache
            .entry(key.to_string())
            .or_insert_with(|| resolve_reference(path, preferred_trunk))
            .clone()
    }

    /// Drop a cached reference, e.g. after a fetch moved the remote trunk.
    pub fn forget(&self, key: &str) {
        let mut cache = match self.references.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.remove(key);
    }

    /// Reference and trunk for a task workspace. Linked worktrees share refs
    /// with their canonical repository and use its cached reference;
    /// standalone clones resolve their own.
    pub fn workspace_reference(
        &self,
        ws: &WorkspaceRef,
        canonical: Option<&CanonicalRepository>,
    ) -> (Option<ReferenceBranch>, String) {
        let configured = canonical.and_then(|c| c.trunk.as_deref());
        let reference = match canonical {
            Some(c) if is_linked_worktree(&ws.path) => {
                let trunk = discover_trunk(&c.root, configured);
                self.reference_for(&c.name, &c.root, Some(&trunk))
            }
            _ => {
                let trunk = discover_trunk(&ws.path, configured);
                self.reference_for(&ws.id.to_string(), &ws.path, Some(&trunk))
            }
        };
        let trunk = match &reference {
            Some(r) => r.trunk.clone(),
            None => discover_trunk(&ws.path, configured),
        };
        (reference, trunk)
    }

    pub fn inspect(&self, path: &Path, reference: Option<&ReferenceBranch>) -> Inspection {
        match inspect_repo(path, reference) {
            Ok(state) => Inspection::Known(state),
            Err(e) => Inspection::Unknown {
                reason: format!("{}: {}", path.display(), e.message()),
            },
        }
    }
}

fn inspect_repo(path: &Path, reference: Option<&ReferenceBranch>) -> Result<RepoState, git2::Error> {
    let repo = Repository::open(path)?;
    if repo.is_bare() {
        return Err(git2::Error::from_str("bare repository has no working tree"));
    }

    let head_ref = repo.head().ok();
    let branch = match &head_ref {
        Some(head) if head.is_branch() => head.shorthand().map(str::to_string),
        Some(_) => None,
        // Unborn HEAD: report the branch it points at.
        None => repo
            .find_reference("HEAD")
            .ok()
            .and_then(|r| r.symbolic_target().map(str::to_string))
            .map(|target| target.trim_start_matches("refs/heads/").to_string()),
    };
    let head = head_ref.as_ref().and_then(|h| h.target());

    let last_commit_at = match head {
        Some(oid) => {
            let commit = repo.find_commit(oid)?;
            DateTime::from_timestamp(commit.time().seconds(), 0)
        }
        None => None,
    };

    let (ahead, behind) = match (head, reference) {
        (Some(local), Some(reference)) => repo.graph_ahead_behind(local, reference.oid)?,
        (Some(local), None) => (count_commits(&repo, local)?, 0),
        (None, _) => (0, 0),
    };

    let (has_upstream, upstream_ahead) = match (&branch, head) {
        (Some(name), Some(local)) => upstream_position(&repo, name, local)?,
        _ => (false, None),
    };

    Ok(RepoState {
        branch,
        head,
        dirty: is_dirty(&repo)?,
        ahead,
        behind,
        has_upstream,
        upstream_ahead,
        last_commit_at,
        reference: reference.map(ReferenceBranch::remote_name),
    })
}

/// Without a reference every local commit counts as unpushed.
fn count_commits(repo: &Repository, head: Oid) -> Result<usize, git2::Error> {
    let mut walk = repo.revwalk()?;
    walk.push(head)?;
    Ok(walk.count())
}

fn upstream_position(
    repo: &Repository,
    branch: &str,
    head: Oid,
) -> Result<(bool, Option<usize>), git2::Error> {
    let local = match repo.find_branch(branch, BranchType::Local) {
        Ok(local) => local,
        Err(_) => return Ok((false, None)),
    };
    let upstream = match local.upstream() {
        Ok(upstream) => upstream,
        Err(_) => return Ok((false, None)),
    };
    match upstream.get().target() {
        Some(target) => {
            let (ahead, _) = repo.graph_ahead_behind(head, target)?;
            Ok((true, Some(ahead)))
        }
        None => Ok((true, None)),
    }
}

fn is_dirty(repo: &Repository) -> Result<bool, git2::Error> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(false)
        .include_ignored(false)
        .exclude_submodules(true);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(statuses.iter().any(|entry| {
        let path = entry.path().unwrap_or_default();
        !entry.status().is_empty()
            && !entry.status().is_ignored()
            && !is_lock_artifact(path.trim_end_matches('/'))
    }))
}

/// First of `origin/<preferred>`, `origin/master`, `origin/main` that resolves.
pub fn resolve_reference(path: &Path, preferred_trunk: Option<&str>) -> Option<ReferenceBranch> {
    let repo = Repository::open(path).ok()?;
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(preferred) = preferred_trunk {
        candidates.push(preferred);
    }
    candidates.extend(
        DEFAULT_TRUNK_CANDIDATES
            .iter()
            .filter(|c| Some(**c) != preferred_trunk),
    );

    candidates.into_iter().find_map(|trunk| {
        let oid = repo
            .find_reference(&format!("refs/remotes/{}/{}", REMOTE, trunk))
            .ok()?
            .peel_to_commit()
            .ok()?
            .id();
        Some(ReferenceBranch {
            trunk: trunk.to_string(),
            oid,
        })
    })
}

/// Trunk name for a canonical repository: configured value, then the
/// remote's HEAD, then whichever of `master`/`main` the remote has, then `master`.
pub fn discover_trunk(path: &Path, configured: Option<&str>) -> String {
    if let Some(trunk) = configured.filter(|t| !t.trim().is_empty()) {
        return trunk.trim().to_string();
    }
    let Ok(repo) = Repository::open(path) else {
        return DEFAULT_TRUNK_CANDIDATES[0].to_string();
    };

    let remote_head_prefix = format!("refs/remotes/{}/", REMOTE);
    if let Some(target) = repo
        .find_reference(&format!("refs/remotes/{}/HEAD", REMOTE))
        .ok()
        .and_then(|r| r.symbolic_target().map(str::to_string))
        && let Some(trunk) = target.strip_prefix(&remote_head_prefix)
    {
        return trunk.to_string();
    }

    DEFAULT_TRUNK_CANDIDATES
        .iter()
        .find(|candidate| {
            repo.find_reference(&format!("{}{}", remote_head_prefix, candidate))
                .is_ok()
        })
        .unwrap_or(&DEFAULT_TRUNK_CANDIDATES[0])
        .to_string()
}

/// Commits on `origin/<branch>` that the reference lacks. `None` when the
/// remote-tracking ref is missing or the graph cannot be walked.
pub fn remote_branch_ahead(path: &Path, branch: &str, reference: &ReferenceBranch) -> Option<usize> {
    let repo = Repository::open(path).ok()?;
    let tip = repo
        .find_reference(&format!("refs/remotes/{}/{}", REMOTE, branch))
        .ok()?
        .target()?;
    repo.graph_ahead_behind(tip, reference.oid)
        .ok()
        .map(|(ahead, _)| ahead)
}

/// Tip of `refs/heads/<branch>`, `None` when the branch does not exist.
pub fn local_branch_tip(path: &Path, branch: &str) -> Result<Option<Oid>, git2::Error> {
    let repo = Repository::open(path)?;
    match repo.find_branch(branch, BranchType::Local) {
        Ok(found) => Ok(found.get().target()),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Tip of the local branch and its commits missing from the reference.
pub fn local_branch_ahead(
    path: &Path,
    branch: &str,
    reference: Option<&ReferenceBranch>,
) -> Result<Option<(Oid, usize)>, git2::Error> {
    let Some(tip) = local_branch_tip(path, branch)? else {
        return Ok(None);
    };
    let repo = Repository::open(path)?;
    let ahead = match reference {
        Some(reference) => repo.graph_ahead_behind(tip, reference.oid)?.0,
        None => count_commits(&repo, tip)?,
    };
    Ok(Some((tip, ahead)))
}
