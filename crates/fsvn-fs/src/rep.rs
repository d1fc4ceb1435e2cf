//! Representation reading and writing.
//!
//! On disk a representation is a text header (`PLAIN`, `DELTA` for a
//! self-contained delta, or `DELTA <rev> <offset> <length>` naming its
//! base), the payload bytes, and a cosmetic `ENDREP` trailer. Reading
//! reconstructs content by applying the svndiff chain; writing streams
//! through MD5/SHA-1 digests into the svndiff encoder and, on close,
//! either keeps the bytes or truncates them away in favor of an already
//! stored representation with the same SHA-1 (rep sharing).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{Cx, NodeRev, RepOrigin, Representation, Rev};
use sha1::{Digest, Sha1};

use crate::registry::ProtoRevLockCookie;
use crate::repo::FsFs;
use crate::svndiff;

/// Upper bound on delta chain length when walking headers; a longer chain
/// is a cycle or corruption.
const MAX_CHAIN: u64 = 10_000;

/// Parsed representation header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RepHeader {
    Plain,
    SelfDelta,
    Delta {
        base_rev: Rev,
        base_offset: u64,
        base_length: u64,
    },
}

impl RepHeader {
    pub(crate) fn unparse(&self) -> String {
        match self {
            Self::Plain => "PLAIN\n".to_owned(),
            Self::SelfDelta => "DELTA\n".to_owned(),
            Self::Delta {
                base_rev,
                base_offset,
                base_length,
            } => format!("DELTA {base_rev} {base_offset} {base_length}\n"),
        }
    }

    pub(crate) fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches('\n');
        if line == "PLAIN" {
            return Ok(Self::Plain);
        }
        if line == "DELTA" {
            return Ok(Self::SelfDelta);
        }
        if let Some(rest) = line.strip_prefix("DELTA ") {
            let mut fields = rest.split_ascii_whitespace();
            let mut next = || -> Result<u64> {
                fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| FsfsError::corrupt(format!("malformed rep header '{line}'")))
            };
            let base_rev = next()?;
            let base_offset = next()?;
            let base_length = next()?;
            return Ok(Self::Delta {
                base_rev,
                base_offset,
                base_length,
            });
        }
        Err(FsfsError::corrupt(format!("malformed rep header '{line}'")))
    }
}

/// The file a representation's bytes live in.
fn rep_file_path(fs: &FsFs, rep: &Representation) -> PathBuf {
    match &rep.origin {
        RepOrigin::Txn(txn_id) => fs.layout().txn_proto_rev(txn_id),
        RepOrigin::Committed(rev) => fs.layout().rev_file(*rev),
    }
}

/// Read the rep header at `rep`'s offset; returns the header and the file
/// offset of the payload behind it.
fn read_rep_header(fs: &FsFs, rep: &Representation) -> Result<(RepHeader, u64)> {
    let file = File::open(rep_file_path(fs, rep)).map_err(FsfsError::Io)?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(rep.offset))
        .map_err(FsfsError::Io)?;
    let mut line = String::new();
    reader.read_line(&mut line).map_err(FsfsError::Io)?;
    let header = RepHeader::parse(&line)?;
    Ok((header, rep.offset + line.len() as u64))
}

fn read_payload(fs: &FsFs, rep: &Representation, payload_offset: u64) -> Result<Vec<u8>> {
    let mut file = File::open(rep_file_path(fs, rep)).map_err(FsfsError::Io)?;
    file.seek(SeekFrom::Start(payload_offset))
        .map_err(FsfsError::Io)?;
    let size = usize::try_from(rep.size)
        .map_err(|_| FsfsError::corrupt("representation size overflows memory"))?;
    let mut payload = vec![0u8; size];
    file.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FsfsError::corrupt(format!(
                "representation at offset {} extends past end of file",
                rep.offset
            ))
        } else {
            FsfsError::Io(e)
        }
    })?;
    Ok(payload)
}

/// A synthetic rep descriptor for a delta base named only by a header.
fn base_rep(base_rev: Rev, base_offset: u64, base_length: u64) -> Representation {
    Representation {
        origin: RepOrigin::Committed(base_rev),
        offset: base_offset,
        size: base_length,
        expanded_size: 0,
        md5: [0; 16],
        sha1: None,
        uniquifier: None,
    }
}

/// Reconstruct the full expanded content of a representation.
pub fn rep_contents(fs: &FsFs, rep: &Representation) -> Result<Vec<u8>> {
    let (header, payload_offset) = read_rep_header(fs, rep)?;
    let content = match header {
        RepHeader::Plain => read_payload(fs, rep, payload_offset)?,
        RepHeader::SelfDelta => {
            let diff = read_payload(fs, rep, payload_offset)?;
            svndiff::apply(&diff, &[])?
        }
        RepHeader::Delta {
            base_rev,
            base_offset,
            base_length,
        } => {
            let source = rep_contents(fs, &base_rep(base_rev, base_offset, base_length))?;
            let diff = read_payload(fs, rep, payload_offset)?;
            svndiff::apply(&diff, &source)?
        }
    };

    // Digest check; synthetic base descriptors carry a zeroed MD5 and are
    // skipped.
    if rep.md5 != [0; 16] {
        let actual: [u8; 16] = md5::compute(&content).0;
        if actual != rep.md5 {
            return Err(FsfsError::corrupt(format!(
                "checksum mismatch reading representation at {}:{}",
                match &rep.origin {
                    RepOrigin::Committed(rev) => rev.to_string(),
                    RepOrigin::Txn(txn) => txn.to_string(),
                },
                rep.offset
            )));
        }
    }
    Ok(content)
}

/// Number of delta links under `rep`, following headers only.
pub(crate) fn rep_chain_length(fs: &FsFs, rep: &Representation) -> Result<u64> {
    let mut length = 1;
    let mut cur = rep.clone();
    loop {
        let (header, _) = read_rep_header(fs, &cur)?;
        match header {
            RepHeader::Plain | RepHeader::SelfDelta => return Ok(length),
            RepHeader::Delta {
                base_rev,
                base_offset,
                base_length,
            } => {
                length += 1;
                if length > MAX_CHAIN {
                    return Err(FsfsError::corrupt("representation delta chain cycles"));
                }
                cur = base_rep(base_rev, base_offset, base_length);
            }
        }
    }
}

/// Choose the delta base for a new representation of `noderev`.
///
/// Skip-delta policy: clear the lowest set bit of the predecessor count to
/// find the target predecessor index, but use a pure linear chain within
/// `max_linear_deltification` of HEAD, and give up entirely past
/// `max_deltification_walk`. A base reached through a shared rep may hang
/// off a different delta chain, so its chain length is capped at
/// `2 * max_linear_deltification + 2`.
///
/// Shared-rep detection has known false positives (copied directories)
/// and false negatives (reps shared within one revision); both are part
/// of the on-disk chain shape and must not be "fixed" here.
pub(crate) fn choose_delta_base(
    fs: &FsFs,
    noderev: &NodeRev,
    props: bool,
) -> Result<Option<Representation>> {
    let count = noderev.predecessor_count;
    if count == 0 {
        return Ok(None);
    }

    let mut idx = count & (count - 1);
    let walk = count - idx;
    if walk < fs.config().max_linear_deltification {
        idx = count - 1;
    }
    if walk > fs.config().max_deltification_walk {
        return Ok(None);
    }

    let mut base = noderev.clone();
    let mut maybe_shared = false;
    for _ in idx..count {
        let pred = base.predecessor_id.clone().ok_or_else(|| {
            FsfsError::corrupt(format!(
                "broken predecessor chain under '{}'",
                noderev.id
            ))
        })?;
        base = fs.node_rev(&pred)?;

        // A rep committed before its node's own revision may be shared.
        let rep = if props { &base.prop_rep } else { &base.data_rep };
        if let (Some(node_rev), Some(rep)) = (base.id.rev(), rep) {
            if rep.revision().is_some_and(|rep_rev| node_rev > rep_rev) {
                maybe_shared = true;
            }
        }
    }

    let rep = if props { base.prop_rep } else { base.data_rep };
    let Some(rep) = rep else {
        return Ok(None);
    };

    if maybe_shared {
        let chain = rep_chain_length(fs, &rep)?;
        if chain >= 2 * fs.config().max_linear_deltification + 2 {
            return Ok(None);
        }
    }
    Ok(Some(rep))
}

/// Verify that a rep-cache row still names a real representation.
///
/// A row pointing past the youngest revision is corruption (left behind
/// by a failed commit, it would become silently wrong once that revision
/// number is reused).
fn check_rep(fs: &FsFs, rep: &Representation) -> Result<()> {
    let Some(rev) = rep.revision() else {
        return Err(FsfsError::corrupt("rep-cache row references a mutable rep"));
    };
    let youngest = fs.youngest_rev()?;
    if rev > youngest {
        return Err(FsfsError::corrupt(format!(
            "rep-cache row references future revision {rev} (youngest is {youngest})"
        )));
    }
    let meta = std::fs::metadata(fs.layout().rev_file(rev)).map_err(|_| {
        FsfsError::corrupt(format!("rep-cache row references missing revision {rev}"))
    })?;
    if rep.offset.saturating_add(rep.size) > meta.len() {
        return Err(FsfsError::corrupt(format!(
            "rep-cache row extends past end of revision {rev}"
        )));
    }
    Ok(())
}

/// Look for an existing representation with the same SHA-1 as `rep`.
///
/// Checks the per-commit in-memory hash, then the sqlite rep-cache, then
/// the transaction's sha1 sidecar files. Non-fatal rep-cache trouble is
/// reported through the warning callback and degrades to "no match"; an
/// inconsistent cache row is fatal.
pub(crate) fn get_shared_rep(
    fs: &FsFs,
    rep: &Representation,
    reps_hash: Option<&HashMap<[u8; 20], Representation>>,
) -> Result<Option<Representation>> {
    if !fs.config().rep_sharing_allowed {
        return Ok(None);
    }
    let Some(sha1) = rep.sha1 else {
        return Ok(None);
    };

    let inherit = |mut old: Representation| {
        // The old rep stands in for the new bytes, but the client-visible
        // content metadata stays the new writer's.
        old.md5 = rep.md5;
        old.uniquifier = rep.uniquifier.clone();
        Some(old)
    };

    if let Some(hash) = reps_hash {
        if let Some(old) = hash.get(&sha1) {
            return Ok(inherit(old.clone()));
        }
    }

    match fs.with_rep_cache(|cache| cache.get_rep_reference(&sha1)) {
        Ok(Some(old)) => {
            check_rep(fs, &old)?;
            return Ok(inherit(old));
        }
        Ok(None) => {}
        Err(err @ FsfsError::Corrupt { .. }) => return Err(err),
        Err(err) => {
            // Rep sharing can proceed without the index, but say so.
            fs.warn(&err);
        }
    }

    if let RepOrigin::Txn(txn_id) = &rep.origin {
        let sidecar = fs.layout().txn_sha1(txn_id, &sha1);
        match std::fs::read_to_string(&sidecar) {
            Ok(text) => {
                let old: Representation = text.trim_end().parse()?;
                return Ok(inherit(old));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsfsError::Io(e)),
        }
    }

    Ok(None)
}

/// Streaming writer for a file node's text representation (§ proto-rev).
///
/// Obtained from [`crate::Txn::apply_text`]. Write content with
/// [`write`](Self::write), then [`close`](Self::close). Dropping an
/// unclosed writer truncates the proto-rev back to its pre-write state
/// and releases the lock, leaving the file byte-identical to before.
pub struct RepWriter<'a> {
    fs: &'a FsFs,
    cx: Cx,
    noderev: NodeRev,
    file: Option<File>,
    cookie: Option<ProtoRevLockCookie>,
    rep_offset: u64,
    delta_start: u64,
    encoder: Option<svndiff::Encoder>,
    md5: md5::Context,
    sha1: Sha1,
    expanded_size: u64,
    finished: bool,
}

impl std::fmt::Debug for RepWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepWriter")
            .field("noderev", &self.noderev)
            .field("rep_offset", &self.rep_offset)
            .field("delta_start", &self.delta_start)
            .field("expanded_size", &self.expanded_size)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'a> RepWriter<'a> {
    pub(crate) fn new(fs: &'a FsFs, cx: &Cx, noderev: NodeRev) -> Result<Self> {
        let txn_id = noderev
            .id
            .txn_id()
            .ok_or_else(|| {
                FsfsError::corrupt(format!(
                    "attempted to write to non-transaction '{}'",
                    noderev.id
                ))
            })?
            .clone();

        let (mut file, cookie) = fs.writable_proto_rev(&txn_id)?;
        let rep_offset = file.stream_position().map_err(FsfsError::Io)?;

        // Everything after this point must restore the proto-rev on error.
        let setup = (|| -> Result<(u64, svndiff::Encoder)> {
            let base = choose_delta_base(fs, &noderev, false)?;
            let source = match &base {
                Some(rep) => rep_contents(fs, rep)?,
                None => Vec::new(),
            };
            let header = match &base {
                Some(rep) => RepHeader::Delta {
                    base_rev: rep.revision().ok_or_else(|| {
                        FsfsError::corrupt("chosen delta base is not committed")
                    })?,
                    base_offset: rep.offset,
                    base_length: rep.size,
                },
                None => RepHeader::SelfDelta,
            };
            file.write_all(header.unparse().as_bytes())
                .map_err(FsfsError::Io)?;
            let delta_start = file.stream_position().map_err(FsfsError::Io)?;
            let encoder = svndiff::Encoder::new(source, fs.config().svndiff_version);
            Ok((delta_start, encoder))
        })();

        match setup {
            Ok((delta_start, encoder)) => Ok(Self {
                fs,
                cx: cx.clone(),
                noderev,
                file: Some(file),
                cookie: Some(cookie),
                rep_offset,
                delta_start,
                encoder: Some(encoder),
                md5: md5::Context::new(),
                sha1: Sha1::new(),
                expanded_size: 0,
                finished: false,
            }),
            Err(e) => {
                let cleanup = (|| -> Result<()> {
                    file.set_len(rep_offset).map_err(FsfsError::Io)?;
                    drop(file);
                    crate::registry::unlock_proto_rev(cookie)
                })();
                Err(fsvn_error::compose(e, cleanup))
            }
        }
    }

    /// Append expanded content bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.cx.checkpoint()?;
        self.md5.consume(data);
        self.sha1.update(data);
        self.expanded_size += data.len() as u64;
        let encoded = self
            .encoder
            .as_mut()
            .expect("encoder present until close")
            .push(data)?;
        self.file
            .as_mut()
            .expect("file present until close")
            .write_all(&encoded)
            .map_err(FsfsError::Io)
    }

    /// Finish the representation: flush the encoder, finalize digests,
    /// attempt rep sharing, write the node-rev, release the lock.
    ///
    /// Returns the final node-revision (its `data_rep` is either the new
    /// rep or the shared older one).
    pub fn close(mut self) -> Result<NodeRev> {
        let result = self.close_inner();
        if result.is_ok() {
            self.finished = true;
        }
        // Drop runs next; with `finished` set it is a no-op, otherwise it
        // rolls the proto-rev back.
        result
    }

    fn close_inner(&mut self) -> Result<NodeRev> {
        let fs = self.fs;
        let txn_id = self
            .noderev
            .id
            .txn_id()
            .expect("checked at construction")
            .clone();
        let mut file = self.file.take().expect("file present until close");

        let finish = (|| -> Result<NodeRev> {
            let tail = self
                .encoder
                .take()
                .expect("encoder present until close")
                .finish()?;
            file.write_all(&tail).map_err(FsfsError::Io)?;

            let end_offset = file.stream_position().map_err(FsfsError::Io)?;
            let md5: [u8; 16] = std::mem::replace(&mut self.md5, md5::Context::new())
                .compute()
                .0;
            let sha1: [u8; 20] = std::mem::take(&mut self.sha1).finalize().into();

            let suffix = crate::transaction::get_new_txn_node_id(fs, &txn_id)?;
            let rep = Representation {
                origin: RepOrigin::Txn(txn_id.clone()),
                offset: self.rep_offset,
                size: end_offset - self.delta_start,
                expanded_size: self.expanded_size,
                md5,
                sha1: Some(sha1),
                uniquifier: Some(format!("{txn_id}/{suffix}")),
            };

            let old_rep = get_shared_rep(fs, &rep, None)?;
            match old_rep {
                Some(old) => {
                    // Erase the bytes we just wrote and reference the
                    // older equivalent instead.
                    file.set_len(self.rep_offset).map_err(FsfsError::Io)?;
                    tracing::debug!(txn = %txn_id, sha1 = %hex::encode(sha1),
                        "rep shared with existing representation");
                    self.noderev.data_rep = Some(old);
                }
                None => {
                    file.write_all(b"ENDREP\n").map_err(FsfsError::Io)?;
                    self.noderev.data_rep = Some(rep);
                }
            }

            crate::tree::put_node_rev(fs, &self.noderev)?;
            if self
                .noderev
                .data_rep
                .as_ref()
                .is_some_and(Representation::is_txn)
            {
                crate::transaction::store_sha1_rep_mapping(fs, &self.noderev)?;
            }
            Ok(self.noderev.clone())
        })();

        match finish {
            Ok(noderev) => {
                // Close the proto-rev file before releasing the lock.
                drop(file);
                let cookie = self.cookie.take().expect("cookie present until close");
                crate::registry::unlock_proto_rev(cookie)?;
                Ok(noderev)
            }
            Err(e) => {
                let cleanup = (|| -> Result<()> {
                    file.set_len(self.rep_offset).map_err(FsfsError::Io)?;
                    drop(file);
                    let cookie = self.cookie.take().expect("cookie present on error path");
                    crate::registry::unlock_proto_rev(cookie)
                })();
                Err(fsvn_error::compose(e, cleanup))
            }
        }
    }
}

impl Drop for RepWriter<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Abandoned mid-write: leave the proto-rev byte-identical to its
        // pre-write state, then let the cookie release the lock.
        if let Some(file) = self.file.take() {
            if let Err(e) = file.set_len(self.rep_offset) {
                tracing::warn!(error = %e, "failed to roll back abandoned rep write");
            }
            drop(file);
        }
        self.cookie.take();
    }
}
