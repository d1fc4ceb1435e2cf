//! Changed-path records.
//!
//! Every mutation inside a transaction appends one record to the
//! transaction's `changes` file; the same format is used for the
//! changed-paths block of a committed revision file. A record is two
//! lines: the change itself, then its copyfrom information (an empty line
//! when the change is not a copy):
//!
//! ```text
//! <noderev-id|-> <kind> <node-kind|-> <text-mod> <prop-mod> <path>
//! [<copyfrom-rev> <copyfrom-path>]
//! ```
//!
//! The path is last on each line so that paths containing spaces survive.

use std::fmt;

use fsvn_error::{FsfsError, Result};

use crate::id::NodeRevId;
use crate::noderev::NodeKind;
use crate::Rev;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
    /// Remove all prior changes folded for this path.
    Reset,
}

impl ChangeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Modify => "modify",
            Self::Reset => "reset",
        }
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = FsfsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "delete" => Ok(Self::Delete),
            "replace" => Ok(Self::Replace),
            "modify" => Ok(Self::Modify),
            "reset" => Ok(Self::Reset),
            other => Err(FsfsError::corrupt(format!("unknown change kind '{other}'"))),
        }
    }
}

/// One changed-path record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    /// Absent only for `Reset` records.
    pub noderev_id: Option<NodeRevId>,
    pub kind: ChangeKind,
    pub node_kind: Option<NodeKind>,
    pub text_mod: bool,
    pub prop_mod: bool,
    pub copyfrom: Option<(Rev, String)>,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.noderev_id {
            Some(id) => write!(f, "{id}")?,
            None => write!(f, "-")?,
        }
        writeln!(
            f,
            " {} {} {} {} {}",
            self.kind.as_str(),
            self.node_kind.map_or("-", NodeKind::as_str),
            if self.text_mod { "true" } else { "false" },
            if self.prop_mod { "true" } else { "false" },
            self.path
        )?;
        match &self.copyfrom {
            Some((rev, path)) => writeln!(f, "{rev} {path}"),
            None => writeln!(f),
        }
    }
}

impl Change {
    /// Parse the two-line record form.
    pub fn parse(change_line: &str, copyfrom_line: &str) -> Result<Self> {
        let malformed = || FsfsError::corrupt(format!("malformed change record '{change_line}'"));

        // Five fixed fields, then the path (which may contain spaces).
        let mut fields = change_line.splitn(6, ' ');
        let id_field = fields.next().ok_or_else(malformed)?;
        let kind_field = fields.next().ok_or_else(malformed)?;
        let node_kind_field = fields.next().ok_or_else(malformed)?;
        let text_field = fields.next().ok_or_else(malformed)?;
        let prop_field = fields.next().ok_or_else(malformed)?;
        let path = fields.next().ok_or_else(malformed)?;
        if path.is_empty() {
            return Err(malformed());
        }

        let noderev_id = match id_field {
            "-" => None,
            id => Some(id.parse()?),
        };
        let kind: ChangeKind = kind_field.parse()?;
        let node_kind = match node_kind_field {
            "-" => None,
            k => Some(k.parse()?),
        };
        let parse_bool = |s: &str| -> Result<bool> {
            match s {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(malformed()),
            }
        };
        let text_mod = parse_bool(text_field)?;
        let prop_mod = parse_bool(prop_field)?;

        let copyfrom = if copyfrom_line.is_empty() {
            None
        } else {
            let (rev, cpath) = copyfrom_line.split_once(' ').ok_or_else(malformed)?;
            let rev = rev.parse().map_err(|_| malformed())?;
            Some((rev, cpath.to_owned()))
        };

        Ok(Self {
            path: path.to_owned(),
            noderev_id,
            kind,
            node_kind,
            text_mod,
            prop_mod,
            copyfrom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TxnId;

    fn sample() -> Change {
        Change {
            path: "/trunk/a file".to_owned(),
            noderev_id: Some(NodeRevId::txn("_0", "0", TxnId::new(2, "7"))),
            kind: ChangeKind::Add,
            node_kind: Some(NodeKind::File),
            text_mod: true,
            prop_mod: false,
            copyfrom: None,
        }
    }

    fn roundtrip(change: &Change) -> Change {
        let text = change.to_string();
        let mut lines = text.lines();
        let change_line = lines.next().unwrap();
        let copyfrom_line = lines.next().unwrap_or("");
        Change::parse(change_line, copyfrom_line).unwrap()
    }

    #[test]
    fn roundtrip_plain() {
        let change = sample();
        assert_eq!(roundtrip(&change), change);
    }

    #[test]
    fn roundtrip_with_copyfrom() {
        let mut change = sample();
        change.kind = ChangeKind::Replace;
        change.copyfrom = Some((3, "/branches/old name".to_owned()));
        assert_eq!(roundtrip(&change), change);
    }

    #[test]
    fn roundtrip_reset_without_id() {
        let change = Change {
            path: "/x".to_owned(),
            noderev_id: None,
            kind: ChangeKind::Reset,
            node_kind: None,
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        };
        assert_eq!(roundtrip(&change), change);
    }

    #[test]
    fn rejects_malformed() {
        assert!(Change::parse("- add file true", "").is_err());
        assert!(Change::parse("- bogus - true false /x", "").is_err());
        assert!(Change::parse("- add - yes false /x", "").is_err());
        assert!(Change::parse("- add - true false /x", "notarev /y").is_err());
    }
}
