//! Interprocess reader/writer lock.
//!
//! Backed by `flock(2)` on a sidecar lock file.  Any number of processes may
//! hold the shared lock at once; the exclusive lock excludes everyone.  The
//! lock file carries no data and is never removed: deleting it would let a
//! waiter lock a stale inode while a newcomer locks a fresh one.
//!
//! Acquisition polls with `LOCK_NB` so that a wedged peer surfaces as
//! [`LockError::Timeout`] instead of hanging the caller forever.
//!
//! Every process sharing the table must lock with `flock` on this same
//! sidecar, directly or through [`crate::SharedTable`].  POSIX record locks
//! (`fcntl`/`lockf`, as used by Python's `fasteners`) are a separate lock
//! family on Linux and do not exclude `flock` holders.  The atomic rename in
//! [`crate::table::write`] still keeps such readers from seeing a torn file,
//! but they are not ordered against flushes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("opening lock file '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {waited:?} waiting for {mode:?} lock on '{}'", path.display())]
    Timeout {
        path: PathBuf,
        mode: LockMode,
        waited: Duration,
    },
    #[error("flock on '{}' failed: {source}", path.display())]
    Flock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("interprocess locking is not supported on this platform")]
    Unsupported,
}

/// A lock file plus the longest time an acquisition may wait.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

/// Holds a lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    mode: LockMode,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        FileLock {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until the lock is granted in `mode` or the timeout expires.
    ///
    /// The lock file and its parent directory are created if missing, so a
    /// table that has never been written can still be locked.
    pub fn acquire(&self, mode: LockMode) -> Result<LockGuard, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;

        let started = Instant::now();
        let mut poll = MIN_POLL;
        loop {
            match try_lock(&file, mode) {
                Ok(true) => {
                    tracing::trace!(path = %self.path.display(), ?mode, "lock acquired");
                    return Ok(LockGuard { file, mode });
                }
                Ok(false) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                    return Err(LockError::Unsupported);
                }
                Err(source) => {
                    return Err(LockError::Flock {
                        path: self.path.clone(),
                        source,
                    });
                }
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    mode,
                    waited,
                });
            }
            std::thread::sleep(poll.min(self.timeout - waited));
            poll = (poll * 2).min(MAX_POLL);
        }
    }
}

impl LockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

/// Returns `Ok(false)` when the lock is held elsewhere.
#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _mode: LockMode) -> std::io::Result<bool> {
    Err(std::io::ErrorKind::Unsupported.into())
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    // Closing the descriptor releases the lock too; this just makes it prompt.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
