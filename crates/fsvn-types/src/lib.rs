//! Core value types for the FrankenSVN repository backend.
//!
//! Everything in this crate is pure data: revision numbers, transaction and
//! node-revision identifiers, representation descriptors, change records,
//! and the line-oriented text grammars they serialize to on disk. File I/O
//! lives in `fsvn-fs`; this crate only parses and unparses.

pub mod change;
pub mod cx;
pub mod hashfile;
pub mod id;
pub mod key36;
pub mod noderev;
pub mod rep;

pub use change::{Change, ChangeKind};
pub use cx::Cx;
pub use id::{IdOrigin, NodeRevId, TxnId};
pub use noderev::{NodeKind, NodeRev};
pub use rep::{RepOrigin, Representation};

/// A revision number. Revision 0 is the initial empty tree.
pub type Rev = u64;

/// Sentinel for "no revision", serialized as `-1`.
///
/// Used where a field is filled in later (a new node's copy-root revision
/// is only known at commit time).
pub const REV_INVALID: Rev = u64::MAX;
