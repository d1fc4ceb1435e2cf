use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for FrankenSVN filesystem operations.
///
/// Modeled after Subversion's FS error codes with Rust-idiomatic structure:
/// structured variants for the common cases, classification helpers for
/// callers that need to decide between retrying, updating, and giving up.
#[derive(Error, Debug)]
pub enum FsfsError {
    // === Repository errors ===
    /// No repository exists at the given path.
    #[error("repository not found: '{path}'")]
    RepositoryNotFound { path: PathBuf },

    /// The repository's format file names a format this library cannot read.
    #[error("unsupported repository format {format} (expected <= {supported})")]
    UnsupportedFormat { format: u32, supported: u32 },

    /// On-disk state is damaged or internally inconsistent.
    #[error("corrupt filesystem: {detail}")]
    Corrupt { detail: String },

    /// A revision number beyond the youngest committed revision.
    #[error("no such revision {rev}")]
    NoSuchRevision { rev: u64 },

    // === Transaction errors ===
    /// The named transaction does not exist (never created, or purged).
    #[error("no such transaction '{name}'")]
    NoSuchTransaction { name: String },

    /// The transaction's base revision is no longer the youngest revision.
    #[error("transaction out of date")]
    TxnOutOfDate,

    /// A writer in this process already holds the proto-rev file.
    #[error(
        "cannot write to the prototype revision file of transaction '{txn_id}' \
         because a previous representation is currently being written by this process"
    )]
    RepBeingWrittenInProcess { txn_id: String },

    /// A writer in another process holds the proto-rev advisory lock.
    #[error(
        "cannot write to the prototype revision file of transaction '{txn_id}' \
         because a previous representation is currently being written by another process"
    )]
    RepBeingWrittenInOtherProcess { txn_id: String },

    /// Ran out of candidate names for a unique file or directory.
    #[error("unique names exhausted in '{path}'")]
    UniqueNamesExhausted { path: PathBuf },

    // === Change journal errors ===
    /// The changed-paths journal contains a sequence fold cannot accept.
    #[error("invalid change ordering: {detail}")]
    InvalidChangeOrdering { detail: String },

    // === Node errors ===
    /// Path lookup found nothing.
    #[error("no such node: '{path}'")]
    NoSuchNode { path: String },

    /// A node already exists where one was to be created.
    #[error("node already exists: '{path}'")]
    AlreadyExists { path: String },

    /// A file operation was applied to a directory.
    #[error("'{path}' is not a file")]
    NotFile { path: String },

    /// A directory operation was applied to a file.
    #[error("'{path}' is not a directory")]
    NotDirectory { path: String },

    // === Lock errors ===
    /// Acquiring an advisory file lock failed for a non-contention reason.
    #[error("file locking failed: {detail}")]
    LockFailed { detail: String },

    /// The committing user does not hold a required path lock.
    #[error("path '{path}' is not locked by the committing user")]
    PathNotLocked { path: String },

    // === Rep-cache errors ===
    /// The rep-sharing index reported a non-fatal problem.
    #[error("rep-cache error: {detail}")]
    RepCache { detail: String },

    // === Property errors ===
    /// A date property could not be parsed.
    #[error("bad date value: '{value}'")]
    BadDate { value: String },

    // === I/O and control flow ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation cancelled via the caller's cancellation context.
    #[error("operation cancelled")]
    Cancelled,
}

impl FsfsError {
    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create an invalid-change-ordering error.
    pub fn change_ordering(detail: impl Into<String>) -> Self {
        Self::InvalidChangeOrdering {
            detail: detail.into(),
        }
    }

    /// Create a rep-cache error.
    pub fn rep_cache(detail: impl Into<String>) -> Self {
        Self::RepCache {
            detail: detail.into(),
        }
    }

    /// Whether a retry of the same operation may succeed without any
    /// other action by the caller (lock contention).
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RepBeingWrittenInProcess { .. }
                | Self::RepBeingWrittenInOtherProcess { .. }
                | Self::LockFailed { .. }
        )
    }

    /// Whether the caller can recover by updating its view and retrying
    /// (as opposed to a bug or on-disk damage).
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TxnOutOfDate
                | Self::RepBeingWrittenInProcess { .. }
                | Self::RepBeingWrittenInOtherProcess { .. }
                | Self::PathNotLocked { .. }
                | Self::NoSuchTransaction { .. }
                | Self::NoSuchNode { .. }
        )
    }

    /// Whether this error indicates a bug or on-disk damage and must never
    /// be retried.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::InvalidChangeOrdering { .. }
        )
    }
}

/// Result type alias using [`FsfsError`].
pub type Result<T> = std::result::Result<T, FsfsError>;

/// Compose a primary error with a cleanup error, preferring the primary.
///
/// Cleanup paths (truncate + unlock) can themselves fail; the original
/// error is what the caller must see, with the cleanup failure noted.
pub fn compose(primary: FsfsError, cleanup: Result<()>) -> FsfsError {
    match cleanup {
        Ok(()) => primary,
        Err(c) => FsfsError::Corrupt {
            detail: format!("{primary} (cleanup also failed: {c})"),
        },
    }
}
