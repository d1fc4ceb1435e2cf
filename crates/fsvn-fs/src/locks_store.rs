//! Path locks and commit-time lock verification.
//!
//! Locks live one-per-file under `locks/`, named by the SHA-1 digest of
//! the locked path. Commit re-verifies ownership of every changed path
//! just before finalizing, because locks may have been added or stolen
//! since the transaction's own operations ran.

use std::collections::BTreeMap;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{Change, ChangeKind};
use sha1::{Digest, Sha1};

use crate::changes::is_child;
use crate::repo::{FsAccess, FsFs};

/// One held path lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLock {
    pub path: String,
    pub token: String,
    pub owner: String,
}

fn digest_path(fs: &FsFs, path: &str) -> std::path::PathBuf {
    let digest = Sha1::digest(path.as_bytes());
    fs.layout().locks_dir().join(hex::encode(digest))
}

impl PathLock {
    fn unparse(&self) -> String {
        format!("{}\n{}\n{}\n", self.path, self.token, self.owner)
    }

    fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let path = lines.next();
        let token = lines.next();
        let owner = lines.next();
        match (path, token, owner) {
            (Some(path), Some(token), Some(owner)) => Ok(Self {
                path: path.to_owned(),
                token: token.to_owned(),
                owner: owner.to_owned(),
            }),
            _ => Err(FsfsError::corrupt("short lock file")),
        }
    }
}

/// Record a lock on `path`, replacing any existing one.
pub fn lock_path(fs: &FsFs, path: &str, token: &str, owner: &str) -> Result<()> {
    let lock = PathLock {
        path: path.to_owned(),
        token: token.to_owned(),
        owner: owner.to_owned(),
    };
    crate::repo::write_atomic(&digest_path(fs, path), lock.unparse().as_bytes(), false)
}

/// Drop the lock on `path`, if any.
pub fn unlock_path(fs: &FsFs, path: &str) -> Result<()> {
    match std::fs::remove_file(digest_path(fs, path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsfsError::Io(e)),
    }
}

/// The lock on exactly `path`.
pub fn get_lock(fs: &FsFs, path: &str) -> Result<Option<PathLock>> {
    match std::fs::read_to_string(digest_path(fs, path)) {
        Ok(text) => Ok(Some(PathLock::parse(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsfsError::Io(e)),
    }
}

/// All locks on `path` or any of its descendants.
fn locks_at_or_below(fs: &FsFs, path: &str) -> Result<Vec<PathLock>> {
    let mut found = Vec::new();
    let dir = match std::fs::read_dir(fs.layout().locks_dir()) {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(FsfsError::Io(e)),
    };
    for entry in dir {
        let entry = entry.map_err(FsfsError::Io)?;
        let text = std::fs::read_to_string(entry.path()).map_err(FsfsError::Io)?;
        let lock = PathLock::parse(&text)?;
        if lock.path == path || is_child(path, &lock.path) {
            found.push(lock);
        }
    }
    Ok(found)
}

fn owns(access: Option<&FsAccess>, lock: &PathLock) -> bool {
    access.is_some_and(|a| a.username == lock.owner && a.tokens.contains(&lock.token))
}

/// Verify that the caller may touch `path`; with `recurse`, also every
/// descendant of `path`.
fn allow_locked_operation(
    fs: &FsFs,
    path: &str,
    recurse: bool,
    access: Option<&FsAccess>,
) -> Result<()> {
    if recurse {
        for lock in locks_at_or_below(fs, path)? {
            if !owns(access, &lock) {
                return Err(FsfsError::PathNotLocked { path: lock.path });
            }
        }
    } else if let Some(lock) = get_lock(fs, path)? {
        if !owns(access, &lock) {
            return Err(FsfsError::PathNotLocked { path: lock.path });
        }
    }
    Ok(())
}

/// Re-verify lock ownership for every folded changed path.
///
/// A `modify` needs the lock on the exact path; everything else needs
/// recursive coverage. After a recursive check of `P`, entries that are
/// descendants of `P` are skipped.
pub(crate) fn verify_locks(
    fs: &FsFs,
    changes: &BTreeMap<String, Change>,
    access: Option<&FsAccess>,
) -> Result<()> {
    // BTreeMap iterates paths in lexicographic order, so descendants
    // directly follow their ancestor.
    let mut last_recursed: Option<String> = None;
    for (path, change) in changes {
        if let Some(parent) = &last_recursed {
            if is_child(parent, path) {
                continue;
            }
        }
        let recurse = change.kind != ChangeKind::Modify;
        allow_locked_operation(fs, path, recurse, access)?;
        if recurse {
            last_recursed = Some(path.clone());
        }
    }
    Ok(())
}
