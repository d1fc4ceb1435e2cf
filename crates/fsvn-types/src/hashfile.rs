//! The length-prefixed key/value ("hash dump") text grammar.
//!
//! Property lists, revision properties, and directory entry listings are
//! all stored in this format:
//!
//! ```text
//! K 7
//! svn:log
//! V 13
//! initial import
//! END
//! ```
//!
//! Mutable directory listings additionally use `D <len>\n<name>\n` records
//! appended after the initial dump to mark entry deletions; [`read_fold`]
//! processes these incrementally. Lengths are byte counts, so values may
//! contain newlines.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use fsvn_error::{FsfsError, Result};

/// Serialize a map as a terminated hash dump.
pub fn write(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        let _ = writeln!(out, "K {}", key.len());
        out.push_str(key);
        out.push('\n');
        let _ = writeln!(out, "V {}", value.len());
        out.push_str(value);
        out.push('\n');
    }
    out.push_str("END\n");
    out
}

/// Append one incremental `K`/`V` record (entry set) to `out`.
pub fn push_entry(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "K {}", key.len());
    out.push_str(key);
    out.push('\n');
    let _ = writeln!(out, "V {}", value.len());
    out.push_str(value);
    out.push('\n');
}

/// Append one incremental `D` record (entry deletion) to `out`.
pub fn push_deletion(out: &mut String, key: &str) {
    let _ = writeln!(out, "D {}", key.len());
    out.push_str(key);
    out.push('\n');
}

/// Parse a terminated hash dump: records up to the first `END` line,
/// which must also end the input.
pub fn read(input: &str) -> Result<BTreeMap<String, String>> {
    let (map, consumed) = parse(input, true)?;
    if consumed != input.len() {
        return Err(FsfsError::corrupt("trailing data after hash dump END"));
    }
    Ok(map)
}

/// Parse a hash dump incrementally, folding `K`/`V` sets and `D` deletions
/// in order. `END` lines are treated as section separators and skipped, so
/// a full dump followed by incremental records parses in one pass.
///
/// Returns the folded map and the number of input bytes consumed.
pub fn read_fold(input: &str) -> Result<(BTreeMap<String, String>, usize)> {
    parse(input, false)
}

fn parse(input: &str, stop_at_end: bool) -> Result<(BTreeMap<String, String>, usize)> {
    let mut map = BTreeMap::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    let read_counted = |pos: &mut usize, header: &str| -> Result<String> {
        let len: usize = header
            .parse()
            .map_err(|_| FsfsError::corrupt(format!("malformed hash dump length '{header}'")))?;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| FsfsError::corrupt("hash dump truncated inside counted value"))?;
        let value = std::str::from_utf8(&bytes[*pos..end])
            .map_err(|_| FsfsError::corrupt("hash dump value is not valid UTF-8"))?
            .to_owned();
        if bytes.get(end) != Some(&b'\n') {
            return Err(FsfsError::corrupt("hash dump value missing newline"));
        }
        *pos = end + 1;
        Ok(value)
    };

    while pos < bytes.len() {
        let line_end = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i)
            .ok_or_else(|| FsfsError::corrupt("hash dump truncated header line"))?;
        let header = std::str::from_utf8(&bytes[pos..line_end])
            .map_err(|_| FsfsError::corrupt("hash dump header is not valid UTF-8"))?;
        pos = line_end + 1;

        if header == "END" {
            if stop_at_end {
                break;
            }
            continue;
        }
        if let Some(klen) = header.strip_prefix("K ") {
            let key = read_counted(&mut pos, klen)?;
            let vline_end = bytes[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| pos + i)
                .ok_or_else(|| FsfsError::corrupt("hash dump truncated V header"))?;
            let vheader = std::str::from_utf8(&bytes[pos..vline_end])
                .map_err(|_| FsfsError::corrupt("hash dump header is not valid UTF-8"))?;
            pos = vline_end + 1;
            let vlen = vheader
                .strip_prefix("V ")
                .ok_or_else(|| FsfsError::corrupt(format!("expected V header, got '{vheader}'")))?;
            let value = read_counted(&mut pos, vlen)?;
            map.insert(key, value);
        } else if let Some(dlen) = header.strip_prefix("D ") {
            let key = read_counted(&mut pos, dlen)?;
            map.remove(&key);
        } else {
            return Err(FsfsError::corrupt(format!(
                "unexpected hash dump header '{header}'"
            )));
        }
    }

    Ok((map, pos))
}
