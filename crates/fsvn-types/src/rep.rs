//! Representation descriptors.
//!
//! A representation names a byte range in a revision file (or, while still
//! mutable, in a transaction's proto-rev file) holding the delta-encoded
//! serialization of a node's text or properties. The text form is a single
//! line of space-separated fields:
//!
//! ```text
//! <origin> <offset> <size> <expanded-size> <md5-hex> <sha1-hex|-> <uniquifier|->
//! ```
//!
//! where `origin` is `r<rev>` for committed reps or `t<txn-id>` for mutable
//! ones. This form appears in node-rev `text:`/`props:` lines and in the
//! per-transaction sha1 sidecar files.

use std::fmt;
use std::str::FromStr;

use fsvn_error::{FsfsError, Result};

use crate::id::TxnId;
use crate::Rev;

/// Whether a representation is mutable (proto-rev) or committed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RepOrigin {
    /// Mutable: the bytes live in this transaction's proto-rev file.
    Txn(TxnId),
    /// Committed: the bytes live in `revs/<rev>`.
    Committed(Rev),
}

/// A representation of a node's text or properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub origin: RepOrigin,
    /// Byte offset of the rep header within its file.
    pub offset: u64,
    /// Size of the encoded svndiff data (header and `ENDREP` excluded).
    pub size: u64,
    /// Size of the fully expanded content.
    pub expanded_size: u64,
    pub md5: [u8; 16],
    pub sha1: Option<[u8; 20]>,
    /// `"<txn>/<seq>"` marker distinguishing otherwise-identical in-flight
    /// reps; carried through rep-sharing.
    pub uniquifier: Option<String>,
}

impl Representation {
    /// The revision the rep was committed in, if immutable.
    pub fn revision(&self) -> Option<Rev> {
        match &self.origin {
            RepOrigin::Txn(_) => None,
            RepOrigin::Committed(rev) => Some(*rev),
        }
    }

    /// True while the rep still lives in a proto-rev file.
    pub fn is_txn(&self) -> bool {
        matches!(self.origin, RepOrigin::Txn(_))
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            RepOrigin::Txn(txn) => write!(f, "t{txn}")?,
            RepOrigin::Committed(rev) => write!(f, "r{rev}")?,
        }
        write!(
            f,
            " {} {} {} {}",
            self.offset,
            self.size,
            self.expanded_size,
            hex::encode(self.md5)
        )?;
        match &self.sha1 {
            Some(sha1) => write!(f, " {}", hex::encode(sha1))?,
            None => write!(f, " -")?,
        }
        match &self.uniquifier {
            Some(u) => write!(f, " {u}"),
            None => write!(f, " -"),
        }
    }
}

impl FromStr for Representation {
    type Err = FsfsError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || FsfsError::corrupt(format!("malformed representation '{s}'"));

        let mut fields = s.split_ascii_whitespace();
        let origin = fields.next().ok_or_else(malformed)?;
        let origin = if let Some(rev) = origin.strip_prefix('r') {
            RepOrigin::Committed(rev.parse().map_err(|_| malformed())?)
        } else if let Some(txn) = origin.strip_prefix('t') {
            RepOrigin::Txn(txn.parse()?)
        } else {
            return Err(malformed());
        };

        let mut next_u64 = |fields: &mut std::str::SplitAsciiWhitespace<'_>| -> Result<u64> {
            fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(malformed)
        };
        let offset = next_u64(&mut fields)?;
        let size = next_u64(&mut fields)?;
        let expanded_size = next_u64(&mut fields)?;

        let md5_hex = fields.next().ok_or_else(malformed)?;
        let mut md5 = [0u8; 16];
        hex::decode_to_slice(md5_hex, &mut md5).map_err(|_| malformed())?;

        let sha1 = match fields.next().ok_or_else(malformed)? {
            "-" => None,
            sha1_hex => {
                let mut sha1 = [0u8; 20];
                hex::decode_to_slice(sha1_hex, &mut sha1).map_err(|_| malformed())?;
                Some(sha1)
            }
        };

        let uniquifier = match fields.next().ok_or_else(malformed)? {
            "-" => None,
            u => Some(u.to_owned()),
        };

        if fields.next().is_some() {
            return Err(malformed());
        }

        Ok(Self {
            origin,
            offset,
            size,
            expanded_size,
            md5,
            sha1,
            uniquifier,
        })
    }
}
