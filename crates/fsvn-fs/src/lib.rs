//! FSFS-style transactional repository backend.
//!
//! This crate turns an in-progress mutable transaction into an atomic,
//! immutable, monotonically numbered revision on disk:
//!
//! - an append-only, crash-consistent store of immutable revision files
//!   (`revs/<N>`), published by renaming a per-transaction "proto-rev"
//!   scratch file into place and then rewriting the `current` pointer;
//! - copy-on-write transactions over a shared base revision, workspaced
//!   under `txns/<id>.txn/`;
//! - content deduplication across history via a SHA-1 keyed rep-sharing
//!   index (sqlite-backed `rep-cache.db`) combined with skip-delta chains
//!   for O(log n) reconstruction;
//! - cross-process coordination through non-blocking advisory file locks
//!   paired with an in-process registry (POSIX locks do not conflict
//!   within a process, so both layers are required).
//!
//! The only suspension points are file-system syscalls and sqlite; there
//! is no async runtime. Long traversals take a [`Cx`](fsvn_types::Cx) and
//! checkpoint cooperatively.

pub mod changes;
pub mod commit;
pub mod layout;
pub mod lock;
pub mod locks_store;
pub mod registry;
pub mod rep;
pub mod rep_cache;
pub mod repo;
pub mod svndiff;
pub mod transaction;
pub mod tree;

pub use repo::{FsAccess, FsFs};
pub use transaction::{Txn, TxnFlags};

/// Tunables for deltification and rep sharing.
///
/// The defaults match the behavior described in the format documentation:
/// a short linear delta window near HEAD, skip-deltas beyond it, and
/// rep-sharing enabled.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Consult and maintain the SHA-1 rep-sharing index.
    pub rep_sharing_allowed: bool,
    /// Write directory listings as deltas against their predecessors.
    pub deltify_directories: bool,
    /// Write property lists as deltas against their predecessors.
    pub deltify_properties: bool,
    /// Length of the pure-linear delta chain segment near HEAD.
    pub max_linear_deltification: u64,
    /// Give up walking the predecessor chain past this many steps and
    /// store a self-contained rep instead.
    pub max_deltification_walk: u64,
    /// Shard `revs/` and `revprops/` into subdirectories of this many
    /// files each.
    pub max_files_per_dir: Option<u64>,
    /// svndiff wire version: 0 (plain) or 1 (zlib-compressed sections).
    pub svndiff_version: u8,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            rep_sharing_allowed: true,
            deltify_directories: true,
            deltify_properties: true,
            max_linear_deltification: 4,
            max_deltification_walk: 16384,
            max_files_per_dir: None,
            svndiff_version: 1,
        }
    }
}
