//! Advisory lock coordinating FIFO writers with the daemon's reopen.
//!
//! Writers hold the lock for a whole request/reply exchange; the daemon takes
//! it (without waiting) before reopening its input after end of file. The
//! lock file is unlinked on release, so a waiter that wakes up on a stale
//! inode retries against the current path.

use crate::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

/// Attempts before giving up on a lock file that keeps being replaced.
const MAX_ATTEMPTS: usize = 16;

pub struct FifoLock {
    lock: Option<Flock<File>>,
    path: PathBuf,
}

impl FifoLock {
    /// Take the lock, blocking until it is free. Call off the runtime.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::lock_with(path, FlockArg::LockExclusive)?
            .ok_or_else(|| Error::Ipc(format!("lock {} unavailable", path.display())))
    }

    /// Take the lock if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        Self::lock_with(path, FlockArg::LockExclusiveNonblock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_with(path: &Path, arg: FlockArg) -> Result<Option<Self>> {
        for _ in 0..MAX_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o660)
                .open(path)?;
            let lock = match Flock::lock(file, arg) {
                Ok(lock) => lock,
                Err((_, Errno::EAGAIN)) => return Ok(None),
                Err((_, Errno::EINTR)) => continue,
                Err((_, errno)) => return Err(errno.into()),
            };
            if is_current(&lock, path)? {
                return Ok(Some(Self {
                    lock: Some(lock),
                    path: path.to_path_buf(),
                }));
            }
        }
        Err(Error::Ipc(format!(
            "lock file {} kept changing underneath us",
            path.display()
        )))
    }
}

/// Whether the locked file is still the one at `path`.
fn is_current(lock: &Flock<File>, path: &Path) -> Result<bool> {
    let held = lock.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.ino() == held.ino() && current.dev() == held.dev()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Drop for FifoLock {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            // Unlink while still holding, then release.
            let _ = fs::remove_file(&self.path);
            drop(lock);
        }
    }
}
