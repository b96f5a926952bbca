//! Cross-process coordination over shared files: exclusive advisory locks
//! with the same escalating-backoff posture as the SQLite busy retry.
//!
//! The flush path serializes writers of the `.hive` sync files through
//! `acquire`; a contended lock waits about a second before surfacing
//! `Locked`, and the flush manager simply retries on the next change.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::{HiveError, Result};

/// First retry delay; doubles each attempt up to [`LOCK_RETRY_CAP_MS`],
/// about one second of waiting in total before `Locked` surfaces.
const LOCK_RETRY_START_MS: u64 = 1;
const LOCK_RETRY_CAP_MS: u64 = 512;

/// An exclusive advisory lock on a path. The lock is released when the
/// guard drops (or the process dies); `release` makes it explicit.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquire, retrying with exponential backoff while another process
    /// holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        let mut delay = Duration::from_millis(LOCK_RETRY_START_MS);
        let cap = Duration::from_millis(LOCK_RETRY_CAP_MS);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        file,
                    });
                }
                Err(_) if delay <= cap => {
                    tracing::debug!(path = %path.display(), ?delay, "lock contended, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(_) => return Err(HiveError::Locked(path.display().to_string())),
            }
        }
    }

    /// Single attempt, no backoff. For callers that would rather skip a
    /// cycle than wait, like the flush manager.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.try_lock_exclusive()
            .map_err(|_| HiveError::Locked(path.display().to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock explicitly; dropping the guard has the same effect.
    pub fn release(self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(Into::into)
}
