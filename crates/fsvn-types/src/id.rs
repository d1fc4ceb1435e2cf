//! Transaction and node-revision identifiers.
//!
//! A transaction id is `"<base-rev>-<seq>"` where `seq` is a base-36
//! counter drawn from the repository's `txn-current` file, making txn ids
//! unique across the lifetime of the repository.
//!
//! A node-revision id is `<node-id>.<copy-id>.<origin>` where the origin is
//! either `t<txn-id>` (mutable, lives in a transaction) or
//! `r<rev>/<offset>` (immutable, committed at a byte offset inside a
//! revision file). Node and copy ids reserved inside a transaction carry a
//! leading `_` to mark them provisional; commit rewrites them to permanent
//! `<seq>-<rev>` ids.

use std::fmt;
use std::str::FromStr;

use fsvn_error::{FsfsError, Result};

use crate::Rev;

/// Identifier of an in-progress transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId {
    base_rev: Rev,
    seq: String,
}

impl TxnId {
    /// Build a txn id from its base revision and base-36 sequence value.
    pub fn new(base_rev: Rev, seq: impl Into<String>) -> Self {
        Self {
            base_rev,
            seq: seq.into(),
        }
    }

    /// The revision this transaction is based on.
    pub fn base_rev(&self) -> Rev {
        self.base_rev
    }

    /// The base-36 sequence component.
    pub fn seq(&self) -> &str {
        &self.seq
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base_rev, self.seq)
    }
}

impl FromStr for TxnId {
    type Err = FsfsError;

    fn from_str(s: &str) -> Result<Self> {
        let (rev, seq) = s
            .split_once('-')
            .ok_or_else(|| FsfsError::corrupt(format!("malformed txn id '{s}'")))?;
        let base_rev: Rev = rev
            .parse()
            .map_err(|_| FsfsError::corrupt(format!("malformed txn id '{s}'")))?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(FsfsError::corrupt(format!("malformed txn id '{s}'")));
        }
        Ok(Self {
            base_rev,
            seq: seq.to_owned(),
        })
    }
}

/// Where a node-revision lives: still mutable inside a transaction, or
/// committed at a fixed offset inside a revision file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdOrigin {
    /// Mutable; the node-rev is stored in the transaction's workspace.
    Txn(TxnId),
    /// Immutable; the node-rev starts at `offset` in `revs/<rev>`.
    Committed { rev: Rev, offset: u64 },
}

/// Composite node-revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    pub node_id: String,
    pub copy_id: String,
    pub origin: IdOrigin,
}

impl NodeRevId {
    /// A mutable id inside transaction `txn`.
    pub fn txn(node_id: impl Into<String>, copy_id: impl Into<String>, txn: TxnId) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            origin: IdOrigin::Txn(txn),
        }
    }

    /// A committed id at `(rev, offset)`.
    pub fn committed(
        node_id: impl Into<String>,
        copy_id: impl Into<String>,
        rev: Rev,
        offset: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            copy_id: copy_id.into(),
            origin: IdOrigin::Committed { rev, offset },
        }
    }

    /// True when the id belongs to an in-progress transaction.
    pub fn is_txn(&self) -> bool {
        matches!(self.origin, IdOrigin::Txn(_))
    }

    /// The owning transaction, if mutable.
    pub fn txn_id(&self) -> Option<&TxnId> {
        match &self.origin {
            IdOrigin::Txn(t) => Some(t),
            IdOrigin::Committed { .. } => None,
        }
    }

    /// The revision the node-rev was committed in, if immutable.
    pub fn rev(&self) -> Option<Rev> {
        match &self.origin {
            IdOrigin::Txn(_) => None,
            IdOrigin::Committed { rev, .. } => Some(*rev),
        }
    }

    /// The byte offset inside the revision file, if immutable.
    pub fn offset(&self) -> Option<u64> {
        match &self.origin {
            IdOrigin::Txn(_) => None,
            IdOrigin::Committed { offset, .. } => Some(*offset),
        }
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            IdOrigin::Txn(txn) => write!(f, "{}.{}.t{}", self.node_id, self.copy_id, txn),
            IdOrigin::Committed { rev, offset } => {
                write!(f, "{}.{}.r{}/{}", self.node_id, self.copy_id, rev, offset)
            }
        }
    }
}

impl FromStr for NodeRevId {
    type Err = FsfsError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || FsfsError::corrupt(format!("malformed node-rev id '{s}'"));

        let mut parts = s.splitn(3, '.');
        let node_id = parts.next().ok_or_else(malformed)?;
        let copy_id = parts.next().ok_or_else(malformed)?;
        let origin = parts.next().ok_or_else(malformed)?;
        if node_id.is_empty() || copy_id.is_empty() {
            return Err(malformed());
        }

        let origin = if let Some(txn) = origin.strip_prefix('t') {
            IdOrigin::Txn(txn.parse()?)
        } else if let Some(rest) = origin.strip_prefix('r') {
            let (rev, offset) = rest.split_once('/').ok_or_else(malformed)?;
            IdOrigin::Committed {
                rev: rev.parse().map_err(|_| malformed())?,
                offset: offset.parse().map_err(|_| malformed())?,
            }
        } else {
            return Err(malformed());
        };

        Ok(Self {
            node_id: node_id.to_owned(),
            copy_id: copy_id.to_owned(),
            origin,
        })
    }
}

/// True for node/copy ids reserved inside a transaction and not yet
/// rewritten to their permanent form.
pub fn is_provisional(key: &str) -> bool {
    key.starts_with('_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_id_roundtrip() {
        let id = TxnId::new(5, "a3");
        assert_eq!(id.to_string(), "5-a3");
        let parsed: TxnId = "5-a3".parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.base_rev(), 5);
        assert_eq!(parsed.seq(), "a3");
    }

    #[test]
    fn txn_id_rejects_garbage() {
        assert!("5".parse::<TxnId>().is_err());
        assert!("x-1".parse::<TxnId>().is_err());
        assert!("5-".parse::<TxnId>().is_err());
        assert!("5-a b".parse::<TxnId>().is_err());
    }

    #[test]
    fn noderev_id_txn_roundtrip() {
        let id = NodeRevId::txn("_3", "0", TxnId::new(7, "1c"));
        assert_eq!(id.to_string(), "_3.0.t7-1c");
        let parsed: NodeRevId = "_3.0.t7-1c".parse().unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.is_txn());
        assert_eq!(parsed.txn_id().unwrap().to_string(), "7-1c");
        assert!(parsed.rev().is_none());
    }

    #[test]
    fn noderev_id_committed_roundtrip() {
        let id = NodeRevId::committed("3-8", "0", 8, 1620);
        assert_eq!(id.to_string(), "3-8.0.r8/1620");
        let parsed: NodeRevId = "3-8.0.r8/1620".parse().unwrap();
        assert_eq!(parsed, id);
        assert!(!parsed.is_txn());
        assert_eq!(parsed.rev(), Some(8));
        assert_eq!(parsed.offset(), Some(1620));
    }

    #[test]
    fn noderev_id_rejects_garbage() {
        assert!("0.0".parse::<NodeRevId>().is_err());
        assert!("0.0.x1".parse::<NodeRevId>().is_err());
        assert!("0.0.r5".parse::<NodeRevId>().is_err());
        assert!(".0.r5/0".parse::<NodeRevId>().is_err());
    }

    #[test]
    fn provisional_detection() {
        assert!(is_provisional("_0"));
        assert!(!is_provisional("0"));
        assert!(!is_provisional("3-8"));
    }
}
