//! POSIX advisory file locking.
//!
//! Cross-process mutual exclusion uses `fcntl` record locks on sentinel
//! files. POSIX locks are per-process (any fd holding a lock represents
//! the whole process, and they never conflict within one process), so
//! every file lock here is paired with an in-process `parking_lot` mutex
//! held for the same duration; see [`crate::registry`].
//!
//! The proto-rev lock is acquired non-blocking: contention is an expected,
//! user-visible condition (`RepBeingWritten*`). The repo write lock and
//! the `txn-current` lock block until available.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use fsvn_error::{FsfsError, Result};

/// Attempt a non-blocking POSIX advisory lock via `fcntl(F_SETLK)`.
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another
/// process holds a conflicting lock, and `Err` for real I/O errors.
#[allow(clippy::cast_possible_wrap)]
fn posix_lock(file: &impl AsFd, lock_type: i32, blocking: bool) -> Result<bool> {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    // start 0 / len 0 locks the whole file, including future growth.
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    let arg = if blocking {
        nix::fcntl::FcntlArg::F_SETLKW(&flock)
    } else {
        nix::fcntl::FcntlArg::F_SETLK(&flock)
    };
    match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
        Err(e) => Err(FsfsError::Io(e.into())),
    }
}

fn posix_unlock(file: &impl AsFd) -> Result<()> {
    let ok = posix_lock(file, libc::F_UNLCK, false)?;
    debug_assert!(ok, "F_UNLCK should never fail with EAGAIN");
    Ok(())
}

fn open_sentinel(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| FsfsError::LockFailed {
            detail: format!("can't open lock file '{}': {e}", path.display()),
        })
}

/// An exclusive advisory lock on a sentinel file, held until drop.
///
/// Closing the file releases the process's lock on it, so dropping the
/// guard is sufficient; the explicit unlock keeps the release visible to
/// other threads of this process that share the inode.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is available.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_sentinel(path)?;
        let ok = posix_lock(&file, libc::F_WRLCK, true)?;
        if !ok {
            // F_SETLKW only returns EAGAIN-class errors on deadlock.
            return Err(FsfsError::LockFailed {
                detail: format!("deadlock avoided on '{}'", path.display()),
            });
        }
        Ok(Self { file })
    }

    /// Try the exclusive lock on `path` without blocking.
    ///
    /// Returns `Ok(None)` when another process holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_sentinel(path)?;
        if posix_lock(&file, libc::F_WRLCK, false)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = posix_unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release advisory file lock");
        }
    }
}
