use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use git2::{Repository, Status, StatusOptions, StatusShow};
use serde::Serialize;

use crate::errors::GuardError;
use crate::lock::is_lock_artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Renamed,
    TypeChange,
    Untracked,
    Deleted,
}

/// One path with uncommitted changes, relative to the working tree root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ChangedPath {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChangedPath {
    /// Content that still exists on disk and must be preserved.
    pub fn needs_copy(&self) -> bool {
        self.kind != ChangeKind::Deleted
    }
}

/// Staged, unstaged and untracked changes, renames resolved to their new path.
/// Untracked directories are expanded to individual files.
pub fn changed_paths(path: &Path) -> Result<Vec<ChangedPath>, GuardError> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.show(StatusShow::IndexAndWorkdir)
        .include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false)
        .exclude_submodules(true)
        .renames_head_to_index(true)
        .renames_index_to_workdir(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut found: BTreeMap<PathBuf, ChangeKind> = BTreeMap::new();

    for entry in statuses.iter() {
        let status = entry.status();
        if status.is_empty() || status.is_ignored() {
            continue;
        }

        // Newest name wins: workdir rename, then index rename, then the entry path.
        let new_path = entry
            .index_to_workdir()
            .and_then(|delta| delta.new_file().path().map(Path::to_path_buf))
            .or_else(|| {
                entry
                    .head_to_index()
                    .and_then(|delta| delta.new_file().path().map(Path::to_path_buf))
            })
            .or_else(|| entry.path().map(PathBuf::from));
        let Some(new_path) = new_path else {
            continue;
        };
        if new_path.to_str().is_some_and(is_lock_artifact) {
            continue;
        }

        let kind = classify(status, &path.join(&new_path));
        found
            .entry(new_path)
            .and_modify(|existing| {
                if *existing == ChangeKind::Deleted {
                    *existing = kind;
                }
            })
            .or_insert(kind);
    }

    Ok(found
        .into_iter()
        .map(|(path, kind)| ChangedPath { path, kind })
        .collect())
}

fn classify(status: Status, on_disk: &Path) -> ChangeKind {
    let deleted = status.is_wt_deleted() || status.is_index_deleted();
    if deleted && !on_disk.exists() {
        return ChangeKind::Deleted;
    }
    if status.is_wt_renamed() || status.is_index_renamed() {
        ChangeKind::Renamed
    } else if status.is_wt_new() {
        ChangeKind::Untracked
    } else if status.is_index_new() {
        ChangeKind::Added
    } else if status.is_wt_typechange() || status.is_index_typechange() {
        ChangeKind::TypeChange
    } else {
        ChangeKind::Modified
    }
}
