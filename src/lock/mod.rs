//! Session locks: soft, timestamped "in use" markers on guarded paths.
//!
//! A lock lives in `<path>/.session-lock` as `timestamp:host:pid`. All reads
//! and writes go through a [`LockStore`], so callers never touch the file
//! format. Automation may only act on a path whose lock is stale.

mod run_lock;

pub use run_lock::RunLock;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::warn;

use crate::errors::GuardError;
use crate::layout::resolve_git_dir;

pub const LOCK_FILE_NAME: &str = ".session-lock";

/// Lock file or a temporary left by an interrupted write. Neither counts as
/// workspace content.
pub fn is_lock_artifact(name: &str) -> bool {
    name.strip_prefix(LOCK_FILE_NAME)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(".tmp-"))
}

/// A lock younger than this keeps automation away.
pub const FRESH_THRESHOLD_HOURS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionLock {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub pid: u32,
}

impl SessionLock {
    pub fn new(timestamp: DateTime<Utc>, host: &str, pid: u32) -> Self {
        Self {
            timestamp,
            host: host.to_string(),
            pid,
        }
    }

    /// Parse `timestamp:host:pid`. The timestamp is either RFC 3339 or unix
    /// seconds; RFC 3339 contains colons, so host and pid are split from the right.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (rest, pid) = raw.rsplit_once(':')?;
        let (stamp, host) = rest.rsplit_once(':')?;
        let pid = pid.trim().parse().ok()?;
        let timestamp = parse_timestamp(stamp.trim())?;
        Some(Self {
            timestamp,
            host: host.trim().to_string(),
            pid,
        })
    }

    pub fn render(&self) -> String {
        format!("{}:{}:{}", self.timestamp.timestamp(), self.host, self.pid)
    }

    /// Fresh iff `now - timestamp < 4h`. A timestamp in the future counts as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.timestamp < TimeDelta::hours(FRESH_THRESHOLD_HOURS)
    }
}

fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(secs) = stamp.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Keyed storage for session locks, one record per resource path.
pub trait LockStore: Send + Sync {
    fn read(&self, resource: &Path) -> Result<Option<SessionLock>, GuardError>;
    fn write(&self, resource: &Path, lock: &SessionLock) -> Result<(), GuardError>;
    /// Returns whether a record existed.
    fn remove(&self, resource: &Path) -> Result<bool, GuardError>;
}

/// Stores each lock as `<resource>/.session-lock`.
#[derive(Debug, Default, Clone)]
pub struct FileLockStore;

impl FileLockStore {
    fn lock_path(resource: &Path) -> PathBuf {
        resource.join(LOCK_FILE_NAME)
    }
}

impl LockStore for FileLockStore {
    fn read(&self, resource: &Path) -> Result<Option<SessionLock>, GuardError> {
        let path = Self::lock_path(resource);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if let Some(lock) = SessionLock::parse(&contents) {
            return Ok(Some(lock));
        }

        // Unreadable token: the file's mtime is the best activity signal left.
        let modified = fs::metadata(&path)?.modified()?;
        warn!(path = %path.display(), "malformed session lock, using file mtime");
        Ok(Some(SessionLock {
            timestamp: DateTime::<Utc>::from(modified),
            host: "unknown".to_string(),
            pid: 0,
        }))
    }

    fn write(&self, resource: &Path, lock: &SessionLock) -> Result<(), GuardError> {
        let path = Self::lock_path(resource);
        let tmp = resource.join(format!("{}.tmp-{}", LOCK_FILE_NAME, std::process::id()));
        let written = fs::write(&tmp, format!("{}\n", lock.render()))
            .and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn remove(&self, resource: &Path) -> Result<bool, GuardError> {
        match fs::remove_file(Self::lock_path(resource)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Why a path is or is not considered in use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Freshness {
    Fresh { lock: SessionLock },
    /// A git index lock exists: a low-level operation is in progress.
    IndexLocked,
    Stale { lock: SessionLock },
    Absent,
    /// The lock could not be read; treated as in use.
    Unreadable { reason: String },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(
            self,
            Freshness::Fresh { .. } | Freshness::IndexLocked | Freshness::Unreadable { .. }
        )
    }

    /// The lock timestamp, fresh or not.
    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        match self {
            Freshness::Fresh { lock } | Freshness::Stale { lock } => Some(lock.timestamp),
            _ => None,
        }
    }
}

pub struct SessionLockManager<S: LockStore = FileLockStore> {
    store: S,
    host: String,
}

impl SessionLockManager<FileLockStore> {
    pub fn new(host: &str) -> Self {
        Self::with_store(FileLockStore, host)
    }
}

impl<S: LockStore> SessionLockManager<S> {
    pub fn with_store(store: S, host: &str) -> Self {
        Self {
            store,
            host: host.to_string(),
        }
    }

    /// Mark `path` as in use by this process. The path must already exist.
    pub fn touch(&self, path: &Path) -> Result<SessionLock, GuardError> {
        self.touch_at(path, Utc::now())
    }

    pub fn touch_at(&self, path: &Path, now: DateTime<Utc>) -> Result<SessionLock, GuardError> {
        if !path.is_dir() {
            return Err(GuardError::Configuration(format!(
                "cannot lock '{}': no such directory",
                path.display()
            )));
        }
        let lock = SessionLock::new(now, &self.host, std::process::id());
        self.store.write(path, &lock)?;
        Ok(lock)
    }

    pub fn is_fresh(&self, path: &Path) -> bool {
        self.freshness_at(path, Utc::now()).is_fresh()
    }

    pub fn freshness(&self, path: &Path) -> Freshness {
        self.freshness_at(path, Utc::now())
    }

    pub fn freshness_at(&self, path: &Path, now: DateTime<Utc>) -> Freshness {
        let lock = match self.store.read(path) {
            Ok(lock) => lock,
            Err(e) => {
                return Freshness::Unreadable {
                    reason: e.to_string(),
                };
            }
        };

        match lock {
            Some(lock) if lock.is_fresh_at(now) => Freshness::Fresh { lock },
            _ if index_lock_present(path) => Freshness::IndexLocked,
            Some(lock) => Freshness::Stale { lock },
            None => Freshness::Absent,
        }
    }

    /// Remove the lock. Only ever called explicitly, never by automation.
    pub fn clear(&self, path: &Path) -> Result<bool, GuardError> {
        self.store.remove(path)
    }
}

/// True when `<git-dir>/index.lock` exists for the checkout at `path`.
pub fn index_lock_present(path: &Path) -> bool {
    resolve_git_dir(path)
        .map(|git_dir| git_dir.join("index.lock").exists())
        .unwrap_or(false)
}
