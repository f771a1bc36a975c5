//! Cross-process store locking.
//!
//! Locks are advisory `flock(2)` locks on files in the store's lock
//! directory. Every create and every clean takes [`GLOBAL_LOCK_KEY`], so
//! builds and collections never overlap.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use strata_common::{StrataError, StrataResult};

/// Key of the lock guarding the whole volume namespace.
pub const GLOBAL_LOCK_KEY: &str = "global-volumes";

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Hands out exclusive locks by key.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Option<Duration>,
}

/// An exclusively held lock, released when dropped.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl LockHandle {
    /// The lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Closing the file releases it too.
        if let Err(e) = flock(&self.file, FlockOperation::Unlock) {
            tracing::debug!(
                path = %self.path.display(),
                error = %e,
                "Failed to unlock, releasing on close"
            );
            return;
        }
        tracing::trace!(path = %self.path.display(), "Lock released");
    }
}

impl LockManager {
    /// Create a manager keeping lock files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: None,
        }
    }

    /// Give up waiting for a lock after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Path of the lock file for `key`.
    #[must_use]
    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Block until the lock for `key` is held exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Lock`] if the lock file cannot be opened or
    /// locked, and [`StrataError::LockTimeout`] if a timeout is configured
    /// and passes first.
    pub fn lock(&self, key: &str) -> StrataResult<LockHandle> {
        let path = self.lock_path(key);
        let lock_error = |message: String| StrataError::Lock {
            path: path.display().to_string(),
            message,
        };

        std::fs::create_dir_all(&self.dir).map_err(|e| lock_error(e.to_string()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| lock_error(e.to_string()))?;

        match self.timeout {
            None => Self::wait(&file).map_err(|e| lock_error(e.to_string()))?,
            Some(timeout) => self.wait_until(&file, &path, timeout)?,
        }

        tracing::debug!(key, path = %path.display(), "Lock acquired");
        Ok(LockHandle { file, path })
    }

    /// Release a lock explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Lock`] if the lock cannot be released.
    pub fn unlock(&self, handle: LockHandle) -> StrataResult<()> {
        flock(&handle.file, FlockOperation::Unlock).map_err(|e| StrataError::Lock {
            path: handle.path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn wait(file: &File) -> Result<(), Errno> {
        loop {
            match flock(file, FlockOperation::LockExclusive) {
                Err(Errno::INTR) => {}
                result => return result,
            }
        }
    }

    fn wait_until(&self, file: &File, path: &Path, timeout: Duration) -> StrataResult<()> {
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match flock(file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => return Ok(()),
                Err(Errno::WOULDBLOCK | Errno::INTR) => {}
                Err(e) => {
                    return Err(StrataError::Lock {
                        path: path.display().to_string(),
                        message: e.to_string(),
                    });
                }
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::warn!(path = %path.display(), dir = %self.dir.display(), "Lock wait timed out");
                return Err(StrataError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
