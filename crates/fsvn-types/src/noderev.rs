//! Node-revision records and their header-style text form.
//!
//! A node-revision is the unit of versioning for one node. On disk it is a
//! block of `key: value` lines terminated by a blank line, both in the
//! per-transaction node files and in the final revision files:
//!
//! ```text
//! id: 0.0.r1/83
//! type: dir
//! pred: 0.0.r0/0
//! count: 1
//! text: r1 0 53 0 f1f8...  - -
//! cpath: /
//! copyroot: 0 /
//! ```

use std::fmt::Write as _;
use std::str::FromStr;

use fsvn_error::{FsfsError, Result};

use crate::id::NodeRevId;
use crate::rep::Representation;
use crate::{Rev, REV_INVALID};

/// Kind of node: regular file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

impl FromStr for NodeKind {
    type Err = FsfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            other => Err(FsfsError::corrupt(format!("unknown node kind '{other}'"))),
        }
    }
}

/// One node-revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRev {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    pub predecessor_count: u64,
    pub data_rep: Option<Representation>,
    pub prop_rep: Option<Representation>,
    /// Canonical path at which this node was created.
    pub created_path: String,
    /// `(rev, path)` this node was copied from, if any.
    pub copyfrom: Option<(Rev, String)>,
    /// [`REV_INVALID`] on nodes created inside a transaction; commit fills
    /// in the new revision number.
    pub copyroot_rev: Rev,
    pub copyroot_path: String,
    /// Set on the root node-rev of a freshly created transaction; never
    /// serialized into a revision file.
    pub is_fresh_txn_root: bool,
}

impl NodeRev {
    /// Serialize to the on-disk block form. The block ends with a single
    /// trailing newline; writers add the blank-line terminator.
    pub fn unparse(&self) -> String {
        let mut out = String::with_capacity(256);
        let _ = writeln!(out, "id: {}", self.id);
        let _ = writeln!(out, "type: {}", self.kind.as_str());
        if let Some(pred) = &self.predecessor_id {
            let _ = writeln!(out, "pred: {pred}");
        }
        if self.predecessor_count != 0 {
            let _ = writeln!(out, "count: {}", self.predecessor_count);
        }
        if let Some(rep) = &self.data_rep {
            let _ = writeln!(out, "text: {rep}");
        }
        if let Some(rep) = &self.prop_rep {
            let _ = writeln!(out, "props: {rep}");
        }
        let _ = writeln!(out, "cpath: {}", self.created_path);
        if let Some((rev, path)) = &self.copyfrom {
            let _ = writeln!(out, "copyfrom: {rev} {path}");
        }
        if self.copyroot_rev == REV_INVALID {
            let _ = writeln!(out, "copyroot: -1 {}", self.copyroot_path);
        } else {
            let _ = writeln!(out, "copyroot: {} {}", self.copyroot_rev, self.copyroot_path);
        }
        if self.is_fresh_txn_root {
            let _ = writeln!(out, "is-fresh-txn-root: y");
        }
        out
    }

    /// Parse a block produced by [`Self::unparse`]. Trailing blank lines
    /// are tolerated.
    pub fn parse(block: &str) -> Result<Self> {
        let mut id = None;
        let mut kind = None;
        let mut predecessor_id = None;
        let mut predecessor_count = 0;
        let mut data_rep = None;
        let mut prop_rep = None;
        let mut created_path = None;
        let mut copyfrom = None;
        let mut copyroot = None;
        let mut is_fresh_txn_root = false;

        for line in block.lines() {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| FsfsError::corrupt(format!("malformed node-rev line '{line}'")))?;
            match key {
                "id" => id = Some(value.parse()?),
                "type" => kind = Some(value.parse()?),
                "pred" => predecessor_id = Some(value.parse()?),
                "count" => {
                    predecessor_count = value.parse().map_err(|_| {
                        FsfsError::corrupt(format!("malformed predecessor count '{value}'"))
                    })?;
                }
                "text" => data_rep = Some(value.parse()?),
                "props" => prop_rep = Some(value.parse()?),
                "cpath" => created_path = Some(value.to_owned()),
                "copyfrom" => copyfrom = Some(parse_rev_path(value)?),
                "copyroot" => copyroot = Some(parse_rev_path(value)?),
                "is-fresh-txn-root" => is_fresh_txn_root = value == "y",
                other => {
                    return Err(FsfsError::corrupt(format!(
                        "unknown node-rev field '{other}'"
                    )));
                }
            }
        }

        let missing = |f: &str| FsfsError::corrupt(format!("node-rev missing '{f}' field"));
        let (copyroot_rev, copyroot_path) = copyroot.ok_or_else(|| missing("copyroot"))?;
        Ok(Self {
            id: id.ok_or_else(|| missing("id"))?,
            kind: kind.ok_or_else(|| missing("type"))?,
            predecessor_id,
            predecessor_count,
            data_rep,
            prop_rep,
            created_path: created_path.ok_or_else(|| missing("cpath"))?,
            copyfrom,
            copyroot_rev,
            copyroot_path,
            is_fresh_txn_root,
        })
    }
}

fn parse_rev_path(value: &str) -> Result<(Rev, String)> {
    let (rev, path) = value
        .split_once(' ')
        .ok_or_else(|| FsfsError::corrupt(format!("malformed rev/path pair '{value}'")))?;
    let rev = if rev == "-1" {
        REV_INVALID
    } else {
        rev.parse()
            .map_err(|_| FsfsError::corrupt(format!("malformed rev/path pair '{value}'")))?
    };
    Ok((rev, path.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TxnId;
    use crate::rep::RepOrigin;

    fn sample() -> NodeRev {
        NodeRev {
            id: NodeRevId::committed("0", "0", 1, 83),
            kind: NodeKind::Dir,
            predecessor_id: Some(NodeRevId::committed("0", "0", 0, 0)),
            predecessor_count: 1,
            data_rep: Some(Representation {
                origin: RepOrigin::Committed(1),
                offset: 0,
                size: 53,
                expanded_size: 53,
                md5: [1; 16],
                sha1: None,
                uniquifier: None,
            }),
            prop_rep: None,
            created_path: "/".to_owned(),
            copyfrom: None,
            copyroot_rev: 0,
            copyroot_path: "/".to_owned(),
            is_fresh_txn_root: false,
        }
    }

    #[test]
    fn unparse_parse_roundtrip() {
        let noderev = sample();
        let block = noderev.unparse();
        let parsed = NodeRev::parse(&block).unwrap();
        assert_eq!(parsed, noderev);
    }

    #[test]
    fn roundtrip_with_all_optionals() {
        let mut noderev = sample();
        noderev.id = NodeRevId::txn("_2", "_1", TxnId::new(4, "b"));
        noderev.kind = NodeKind::File;
        noderev.copyfrom = Some((3, "/branches/a b".to_owned()));
        noderev.created_path = "/trunk/a b".to_owned();
        noderev.is_fresh_txn_root = true;
        let parsed = NodeRev::parse(&noderev.unparse()).unwrap();
        assert_eq!(parsed, noderev);
    }

    #[test]
    fn zero_count_omitted() {
        let mut noderev = sample();
        noderev.predecessor_count = 0;
        noderev.predecessor_id = None;
        let block = noderev.unparse();
        assert!(!block.contains("count:"));
        assert_eq!(NodeRev::parse(&block).unwrap().predecessor_count, 0);
    }

    #[test]
    fn parse_stops_at_blank_line() {
        let mut block = sample().unparse();
        block.push('\n');
        block.push_str("id: garbage that must not be read\n");
        let parsed = NodeRev::parse(&block).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn unset_copyroot_rev_roundtrips_as_minus_one() {
        let mut noderev = sample();
        noderev.copyroot_rev = REV_INVALID;
        let block = noderev.unparse();
        assert!(block.contains("copyroot: -1 /"));
        assert_eq!(NodeRev::parse(&block).unwrap().copyroot_rev, REV_INVALID);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(NodeRev::parse("id: 0.0.r0/0\n").is_err());
        assert!(NodeRev::parse("type: dir\ncpath: /\ncopyroot: 0 /\n").is_err());
        assert!(NodeRev::parse("bogus line\n").is_err());
    }
}
