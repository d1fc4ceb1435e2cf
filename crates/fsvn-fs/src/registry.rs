//! In-process shared transaction state.
//!
//! Each repository has one [`SharedFsData`] per process, found through a
//! process-global table keyed by the canonicalized repository root. This
//! coalescing is load-bearing: POSIX advisory locks never conflict between
//! two handles in the same process, so the `being_written` flag (under the
//! table mutex) provides in-process exclusion while the `rev-lock` file
//! provides cross-process exclusion. Both layers together enforce that at
//! most one proto-rev writer of a given transaction exists system-wide.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use fsvn_error::{FsfsError, Result};
use fsvn_types::{Rev, TxnId};
use parking_lot::Mutex;

use crate::layout::Layout;
use crate::lock::FileLock;

/// Per-transaction shared record.
#[derive(Debug, Default)]
struct SharedTxn {
    /// True while a writer holds the proto-rev file open in this process.
    being_written: bool,
}

/// Per-repository, per-process shared state.
#[derive(Debug, Default)]
pub(crate) struct SharedFsData {
    txns: Mutex<HashMap<TxnId, SharedTxn>>,
    /// In-process pairing for the cross-process commit write lock.
    pub(crate) write_lock_mutex: Mutex<()>,
    /// In-process pairing for the `txn-current` lock.
    pub(crate) txn_current_mutex: Mutex<()>,
    /// Youngest revision as last observed by this process.
    pub(crate) youngest_cache: Mutex<Option<Rev>>,
}

/// The process-global repository table.
fn global_registry() -> &'static Mutex<HashMap<PathBuf, Arc<SharedFsData>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<SharedFsData>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get or create the shared state for the repository at `root`.
///
/// The root must exist; the canonicalized path is the coalescing key, so
/// two handles opened through different spellings of the same directory
/// share one record.
pub(crate) fn shared_data_for(root: &Path) -> Result<Arc<SharedFsData>> {
    let canonical = root.canonicalize().map_err(FsfsError::Io)?;
    let mut registry = global_registry().lock();
    Ok(Arc::clone(
        registry.entry(canonical).or_insert_with(Arc::default),
    ))
}

/// Opaque cookie for a held proto-rev lock.
///
/// Returned by [`get_writable_proto_rev`]; pass it back to
/// [`unlock_proto_rev`] after the proto-rev file handle has been closed.
/// Dropping an unreleased cookie releases the lock as a safety net so the
/// `being_written` flag stays consistent with the file lock on every exit
/// path.
#[derive(Debug)]
pub(crate) struct ProtoRevLockCookie {
    txn_id: TxnId,
    shared: Arc<SharedFsData>,
    lock: Option<FileLock>,
}

impl ProtoRevLockCookie {
    fn release_inner(&mut self) -> Result<()> {
        let lock = match self.lock.take() {
            Some(lock) => lock,
            None => return Ok(()),
        };
        let mut table = self.shared.txns.lock();
        let entry = table.get_mut(&self.txn_id).ok_or_else(|| {
            FsfsError::corrupt(format!("can't unlock unknown transaction '{}'", self.txn_id))
        })?;
        if !entry.being_written {
            return Err(FsfsError::corrupt(format!(
                "can't unlock nonlocked transaction '{}'",
                self.txn_id
            )));
        }
        drop(lock);
        entry.being_written = false;
        Ok(())
    }
}

impl Drop for ProtoRevLockCookie {
    fn drop(&mut self) {
        if self.lock.is_some() {
            if let Err(e) = self.release_inner() {
                tracing::warn!(txn_id = %self.txn_id, error = %e,
                    "proto-rev lock released on abnormal path");
            }
        }
    }
}

/// Get a writable handle on the proto-rev file of `txn_id`, positioned at
/// end of file, plus the lock cookie protecting it.
///
/// Fails with `RepBeingWrittenInProcess` when this process already has a
/// writer, and `RepBeingWrittenInOtherProcess` when the advisory file lock
/// is held elsewhere.
pub(crate) fn get_writable_proto_rev(
    shared: &Arc<SharedFsData>,
    layout: &Layout,
    txn_id: &TxnId,
) -> Result<(File, ProtoRevLockCookie)> {
    let mut cookie = {
        let mut table = shared.txns.lock();
        let entry = table.entry(txn_id.clone()).or_default();

        // First, ensure no thread in this process (including this one) is
        // currently writing to this transaction's proto-rev file.
        if entry.being_written {
            return Err(FsfsError::RepBeingWrittenInProcess {
                txn_id: txn_id.to_string(),
            });
        }

        // No thread in this process holds the lock file, so it is safe to
        // probe whether another process does.
        let lock = FileLock::try_acquire(&layout.txn_proto_rev_lock(txn_id))?.ok_or_else(|| {
            FsfsError::RepBeingWrittenInOtherProcess {
                txn_id: txn_id.to_string(),
            }
        })?;

        entry.being_written = true;
        ProtoRevLockCookie {
            txn_id: txn_id.clone(),
            shared: Arc::clone(shared),
            lock: Some(lock),
        }
    };

    // Now open the prototype revision file and seek to the end.
    let open_result = (|| -> Result<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(layout.txn_proto_rev(txn_id))
            .map_err(FsfsError::Io)?;
        file.seek(SeekFrom::End(0)).map_err(FsfsError::Io)?;
        Ok(file)
    })();

    match open_result {
        Ok(file) => Ok((file, cookie)),
        Err(e) => Err(fsvn_error::compose(e, cookie.release_inner())),
    }
}

/// Release a proto-rev lock. The proto-rev file handle must already be
/// closed.
pub(crate) fn unlock_proto_rev(mut cookie: ProtoRevLockCookie) -> Result<()> {
    cookie.release_inner()
}

/// Drop the shared record for a purged transaction.
pub(crate) fn forget_txn(shared: &SharedFsData, txn_id: &TxnId) {
    shared.txns.lock().remove(txn_id);
}
