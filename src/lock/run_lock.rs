use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::GuardError;

/// Exclusive per-host lock for one component run, held until dropped.
///
/// Two invocations of the same component on one host never overlap; the
/// second one sees the lock held and exits as superseded.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// `Ok(None)` when another process holds the lock.
    pub fn try_acquire(locks_dir: &Path, component: &str) -> Result<Option<Self>, GuardError> {
        std::fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", component));
        // Do not truncate before holding the lock: the holder's pid lives there.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
