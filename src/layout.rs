//! Filesystem layout: canonical clones and task workspaces.
//!
//! Canonical clones live at `<canonical_root>/<repo-name>`. Workspaces live at
//! `<workspace_root>/<task-id>/<repo-name>`, exactly one per pair.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::Config;
use crate::errors::GuardError;

/// A long-lived shared clone that must stay clean and on trunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRepository {
    pub name: String,
    pub root: PathBuf,
    /// Configured trunk; discovered from the remote when `None`
    pub trunk: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId {
    pub task_id: String,
    pub repo: String,
}

impl std::fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.task_id, self.repo)
    }
}

/// A discovered task workspace on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRef {
    pub id: WorkspaceId,
    pub path: PathBuf,
}

/// Canonical repositories for this run: the configured list, or every git
/// checkout directly under the canonical root when none are configured.
pub fn canonical_repositories(config: &Config) -> Result<Vec<CanonicalRepository>, GuardError> {
    config.require_canonical_root()?;

    if !config.repos.is_empty() {
        return Ok(config
            .repos
            .iter()
            .map(|entry| CanonicalRepository {
                name: entry.name.clone(),
                root: config.canonical_root.join(&entry.name),
                trunk: entry.trunk.clone(),
            })
            .collect());
    }

    let entries = fs::read_dir(&config.canonical_root).map_err(|e| {
        GuardError::Configuration(format!(
            "cannot read canonical root '{}': {}",
            config.canonical_root.display(),
            e
        ))
    })?;

    let mut repos: Vec<CanonicalRepository> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && is_git_checkout(path))
        .filter_map(|root| {
            let name = root.file_name()?.to_string_lossy().to_string();
            Some(CanonicalRepository {
                name,
                root,
                trunk: None,
            })
        })
        .collect();
    repos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(repos)
}

/// Look up the canonical repository a workspace belongs to, by name.
pub fn canonical_for<'a>(
    repos: &'a [CanonicalRepository],
    repo_name: &str,
) -> Option<&'a CanonicalRepository> {
    repos.iter().find(|r| r.name == repo_name)
}

/// Every `<task-id>/<repo-name>` checkout under the workspace root, sorted.
/// A missing root means there is nothing to collect.
pub fn discover_workspaces(workspace_root: &Path) -> Vec<WorkspaceRef> {
    if !workspace_root.is_dir() {
        return Vec::new();
    }

    let mut found: Vec<WorkspaceRef> = WalkDir::new(workspace_root)
        .min_depth(2)
        .max_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir() && is_git_checkout(entry.path()))
        .filter_map(|entry| workspace_ref_from_path(workspace_root, entry.path()))
        .collect();
    found.sort_by(|a, b| a.id.cmp(&b.id));
    found
}

/// Workspaces of a single task.
pub fn task_workspaces(workspace_root: &Path, task_id: &str) -> Vec<WorkspaceRef> {
    discover_workspaces(workspace_root)
        .into_iter()
        .filter(|ws| ws.id.task_id == task_id)
        .collect()
}

fn workspace_ref_from_path(root: &Path, path: &Path) -> Option<WorkspaceRef> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.components();
    let task_id = parts.next()?.as_os_str().to_string_lossy().to_string();
    let repo = parts.next()?.as_os_str().to_string_lossy().to_string();
    Some(WorkspaceRef {
        id: WorkspaceId { task_id, repo },
        path: path.to_path_buf(),
    })
}

/// Reject task ids that would escape the workspace root.
pub fn validate_task_id(task_id: &str) -> Result<(), GuardError> {
    let trimmed = task_id.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(GuardError::Configuration(format!(
            "invalid task id '{}'",
            task_id
        )));
    }
    Ok(())
}

/// True when `path` has a `.git` directory, or a `.git` file pointing at one.
pub fn is_git_checkout(path: &Path) -> bool {
    resolve_git_dir(path).is_some()
}

/// True when `.git` is a `gitdir:` pointer, i.e. a linked worktree.
pub fn is_linked_worktree(path: &Path) -> bool {
    path.join(".git").is_file()
}

/// The administrative git directory for a checkout.
pub fn resolve_git_dir(path: &Path) -> Option<PathBuf> {
    let dot_git = path.join(".git");
    let metadata = fs::metadata(&dot_git).ok()?;
    if metadata.is_dir() {
        return Some(dot_git);
    }
    if !metadata.is_file() {
        return None;
    }

    let contents = fs::read_to_string(&dot_git).ok()?;
    let pointer = contents.trim().strip_prefix("gitdir:")?.trim();
    if pointer.is_empty() {
        return None;
    }
    let target = Path::new(pointer);
    Some(if target.is_absolute() {
        target.to_path_buf()
    } else {
        path.join(target)
    })
}

/// Remove a task directory once its last workspace is gone.
pub fn remove_task_dir_if_empty(workspace_root: &Path, task_id: &str) -> std::io::Result<bool> {
    let dir = workspace_root.join(task_id);
    match fs::read_dir(&dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(&dir)?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
