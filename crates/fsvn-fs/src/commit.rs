//! The commit pipeline.
//!
//! One worker, holding the repository-wide write lock, turns a mutable
//! transaction into revision `N+1`: verify the transaction is based on
//! the youngest revision, re-verify path locks, walk the mutable tree
//! writing final node-revs into the proto-rev file, append the folded
//! changed-paths block and the trailer, fsync, rename the proto-rev into
//! `revs/<N+1>`, and rewrite `current`. The `current` rewrite is the
//! single linearization point that makes the revision visible; a reader
//! that observes `current == N` sees `revs/0 … revs/N` as complete,
//! immutable files.
//!
//! Newly observed `sha1 → rep` rows land in the rep-cache after the write
//! lock is released, in one sqlite transaction; collisions are ignored.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Seek, SeekFrom, Write as _};

use fsvn_error::{FsfsError, Result};
use fsvn_types::{
    hashfile, id::is_provisional, Change, Cx, NodeKind, NodeRev, NodeRevId, RepOrigin,
    Representation, Rev, TxnId,
};

use crate::lock::FileLock;
use crate::rep::{choose_delta_base, get_shared_rep, rep_contents, RepHeader};
use crate::repo::{fsync_dir, now_timestamp, FsFs};
use crate::svndiff;
use crate::transaction::{
    change_txn_props, get_txn_props, Txn, PROP_REVISION_DATE, PROP_TXN_CHECK_LOCKS,
    PROP_TXN_CHECK_OOD,
};
use crate::tree;
use crate::{changes, locks_store, registry};

/// Walk state shared down the final-rev recursion.
struct CommitWalk<'a> {
    fs: &'a FsFs,
    cx: &'a Cx,
    new_rev: Rev,
    initial_offset: u64,
    /// Data and property reps new in this revision, destined for the
    /// rep-cache.
    reps_to_cache: Vec<Representation>,
    /// Property reps new in this revision, for intra-commit dedup.
    reps_hash: HashMap<[u8; 20], Representation>,
    /// Mutable id → permanent id, for rewriting the changed-paths block.
    id_map: HashMap<NodeRevId, NodeRevId>,
}

/// Rename `src` into `dst`, carrying permissions over from `perms_ref`,
/// and make the rename durable.
fn move_into_place(src: &std::path::Path, dst: &std::path::Path, perms_ref: &std::path::Path) -> Result<()> {
    if let Ok(meta) = fs::metadata(perms_ref) {
        if let Err(e) = fs::set_permissions(src, meta.permissions()) {
            tracing::debug!(error = %e, "could not copy permissions onto new revision file");
        }
    }
    fs::rename(src, dst).map_err(FsfsError::Io)?;
    if let Some(parent) = dst.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Serialize `content` as a (possibly deltified) rep appended to the
/// proto-rev file, attempting rep sharing before keeping the bytes.
fn write_container_rep(
    walk: &mut CommitWalk<'_>,
    file: &mut fs::File,
    content: &[u8],
    noderev: &NodeRev,
    props: bool,
    use_reps_hash: bool,
) -> Result<Representation> {
    let offset = file.stream_position().map_err(FsfsError::Io)?;
    let deltify = if props {
        walk.fs.config().deltify_properties
    } else {
        walk.fs.config().deltify_directories
    };

    let md5: [u8; 16] = md5::compute(content).0;
    let sha1: [u8; 20] = {
        use sha1::Digest as _;
        sha1::Sha1::digest(content).into()
    };

    let delta_start;
    if deltify {
        let base = choose_delta_base(walk.fs, noderev, props)?;
        let (header, source) = match &base {
            Some(rep) => (
                RepHeader::Delta {
                    base_rev: rep
                        .revision()
                        .ok_or_else(|| FsfsError::corrupt("chosen delta base is not committed"))?,
                    base_offset: rep.offset,
                    base_length: rep.size,
                },
                rep_contents(walk.fs, rep)?,
            ),
            None => (RepHeader::SelfDelta, Vec::new()),
        };
        file.write_all(header.unparse().as_bytes())
            .map_err(FsfsError::Io)?;
        delta_start = file.stream_position().map_err(FsfsError::Io)?;
        let diff = svndiff::encode(&source, content, walk.fs.config().svndiff_version)?;
        file.write_all(&diff).map_err(FsfsError::Io)?;
    } else {
        file.write_all(RepHeader::Plain.unparse().as_bytes())
            .map_err(FsfsError::Io)?;
        delta_start = file.stream_position().map_err(FsfsError::Io)?;
        file.write_all(content).map_err(FsfsError::Io)?;
    }
    let end = file.stream_position().map_err(FsfsError::Io)?;

    let rep = Representation {
        origin: RepOrigin::Committed(walk.new_rev),
        offset,
        size: end - delta_start,
        expanded_size: content.len() as u64,
        md5,
        sha1: Some(sha1),
        uniquifier: None,
    };

    let reps_hash = use_reps_hash.then_some(&walk.reps_hash);
    if let Some(old) = get_shared_rep(walk.fs, &rep, reps_hash)? {
        // Erase from the proto-rev the bytes just written.
        file.set_len(offset).map_err(FsfsError::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(FsfsError::Io)?;
        return Ok(old);
    }

    file.write_all(b"ENDREP\n").map_err(FsfsError::Io)?;
    Ok(rep)
}

/// Sanity-check the would-be root node-revision of `new_rev`.
fn validate_root_noderev(fs: &FsFs, root: &NodeRev, new_rev: Rev) -> Result<()> {
    let old_rev = new_rev - 1;
    let head_root = fs.node_rev(&fs.rev_root_id(old_rev)?)?;
    let advanced = root
        .predecessor_count
        .wrapping_sub(head_root.predecessor_count);
    if advanced != new_rev - old_rev {
        return Err(FsfsError::corrupt(format!(
            "predecessor count for the root node-revision is wrong: found ({} + {} != {}), committing r{}",
            head_root.predecessor_count,
            new_rev - old_rev,
            root.predecessor_count,
            new_rev
        )));
    }
    Ok(())
}

/// Copy one mutable node-revision (and, for directories, all mutable
/// children first) into the proto-rev file, assigning its permanent id.
///
/// Returns the new id, or `None` if the node was not mutable.
fn write_final_rev(
    walk: &mut CommitWalk<'_>,
    file: &mut fs::File,
    id: &NodeRevId,
    at_root: bool,
) -> Result<Option<NodeRevId>> {
    walk.cx.checkpoint()?;
    if !id.is_txn() {
        return Ok(None);
    }
    let mut noderev = walk.fs.node_rev(id)?;

    if noderev.kind == NodeKind::Dir {
        // Write out all the children first, then the updated listing.
        let mut entries = tree::dir_entries(walk.fs, &noderev)?;
        for (_, entry) in entries.iter_mut() {
            if let Some(new_id) = write_final_rev(walk, file, &entry.id, false)? {
                entry.id = new_id;
            }
        }

        if noderev
            .data_rep
            .as_ref()
            .is_some_and(Representation::is_txn)
        {
            let mut listing = BTreeMap::new();
            for (name, entry) in &entries {
                listing.insert(name.clone(), tree::unparse_dir_entry(entry));
            }
            let content = hashfile::write(&listing);
            let rep =
                write_container_rep(walk, file, content.as_bytes(), &noderev, false, false)?;
            noderev.data_rep = Some(rep);
        }
    } else if let Some(rep) = &mut noderev.data_rep {
        if rep.is_txn() {
            // The rep bytes are already in the proto-rev; it becomes part
            // of the new revision at the same offset.
            rep.origin = RepOrigin::Committed(walk.new_rev);
            if rep.offset + rep.size > walk.initial_offset {
                return Err(FsfsError::corrupt("truncated protorev file detected"));
            }
        }
    }

    if noderev
        .prop_rep
        .as_ref()
        .is_some_and(Representation::is_txn)
    {
        let props = tree::node_props(walk.fs, &noderev)?;
        let content = hashfile::write(&props);
        let rep = write_container_rep(walk, file, content.as_bytes(), &noderev, true, true)?;
        noderev.prop_rep = Some(rep);
    }

    // Convert the temporary id into a permanent revision one.
    let my_offset = file.stream_position().map_err(FsfsError::Io)?;
    let node_id = if is_provisional(&noderev.id.node_id) {
        format!("{}-{}", &noderev.id.node_id[1..], walk.new_rev)
    } else {
        noderev.id.node_id.clone()
    };
    let copy_id = if is_provisional(&noderev.id.copy_id) {
        format!("{}-{}", &noderev.id.copy_id[1..], walk.new_rev)
    } else {
        noderev.id.copy_id.clone()
    };
    if noderev.copyroot_rev == fsvn_types::REV_INVALID {
        noderev.copyroot_rev = walk.new_rev;
    }
    let old_id = noderev.id.clone();
    let new_id = NodeRevId::committed(node_id, copy_id, walk.new_rev, my_offset);
    noderev.id = new_id.clone();

    if walk.fs.config().rep_sharing_allowed {
        if noderev.kind == NodeKind::File {
            if let Some(rep) = &noderev.data_rep {
                if rep.revision() == Some(walk.new_rev) {
                    walk.reps_to_cache.push(rep.clone());
                }
            }
        }
        if let Some(rep) = &noderev.prop_rep {
            if rep.revision() == Some(walk.new_rev) {
                walk.reps_to_cache.push(rep.clone());
                if let Some(sha1) = rep.sha1 {
                    walk.reps_hash.insert(sha1, rep.clone());
                }
            }
        }
    }

    // SHA-1 digests of directory listings and property reps are not worth
    // the bytes in the final file.
    if noderev.kind == NodeKind::Dir {
        if let Some(rep) = &mut noderev.data_rep {
            rep.sha1 = None;
        }
    }
    if let Some(rep) = &mut noderev.prop_rep {
        rep.sha1 = None;
    }

    noderev.is_fresh_txn_root = false;

    if at_root {
        validate_root_noderev(walk.fs, &noderev, walk.new_rev)?;
    }

    let mut block = noderev.unparse();
    block.push('\n');
    file.write_all(block.as_bytes()).map_err(FsfsError::Io)?;

    walk.id_map.insert(old_id, new_id.clone());
    Ok(Some(new_id))
}

/// Write the folded changed-paths block, with mutable node-rev ids
/// rewritten to their permanent forms.
fn write_final_changed_path_info(
    walk: &CommitWalk<'_>,
    file: &mut fs::File,
    txn_id: &TxnId,
) -> Result<(u64, BTreeMap<String, Change>)> {
    let offset = file.stream_position().map_err(FsfsError::Io)?;
    let mut folded = changes::fetch(walk.cx, walk.fs.layout(), txn_id)?;
    for change in folded.values_mut() {
        if let Some(id) = &change.noderev_id {
            if let Some(new_id) = walk.id_map.get(id) {
                change.noderev_id = Some(new_id.clone());
            }
        }
    }
    file.write_all(changes::unparse_records(&folded).as_bytes())
        .map_err(FsfsError::Io)?;
    Ok((offset, folded))
}

fn commit_body(
    fs: &FsFs,
    cx: &Cx,
    txn: &Txn<'_>,
    set_timestamp: bool,
    reps_out: &mut Vec<Representation>,
) -> Result<Rev> {
    let txn_id = txn.id().clone();

    // The transaction must be based on the youngest revision.
    let old_rev = fs.youngest_rev()?;
    if txn.base_rev() != old_rev {
        return Err(FsfsError::TxnOutOfDate);
    }

    // Locks may have been added or stolen since the transaction's own
    // operations ran; re-verify every changed path.
    let folded = changes::fetch(cx, fs.layout(), &txn_id)?;
    locks_store::verify_locks(fs, &folded, fs.access().as_ref())?;
    drop(folded);

    let new_rev = old_rev + 1;

    let (mut proto_file, cookie) = fs.writable_proto_rev(&txn_id)?;
    let initial_offset = proto_file.stream_position().map_err(FsfsError::Io)?;

    let mut walk = CommitWalk {
        fs,
        cx,
        new_rev,
        initial_offset,
        reps_to_cache: Vec::new(),
        reps_hash: HashMap::new(),
        id_map: HashMap::new(),
    };

    // Write out all the node-revisions and directory contents.
    let root_id = tree::txn_root_id(&txn_id);
    let new_root_id = write_final_rev(&mut walk, &mut proto_file, &root_id, true)?
        .ok_or_else(|| FsfsError::corrupt("transaction root is not mutable"))?;

    // Changed-paths block, then the trailer line.
    let (changed_path_offset, _) =
        write_final_changed_path_info(&walk, &mut proto_file, &txn_id)?;
    let root_offset = new_root_id
        .offset()
        .expect("permanent ids carry an offset");
    proto_file
        .write_all(format!("{root_offset} {changed_path_offset}\n").as_bytes())
        .map_err(FsfsError::Io)?;

    proto_file.sync_all().map_err(FsfsError::Io)?;
    drop(proto_file);
    // The advisory lock stays held across the rename so no late writer
    // can append to the proto-rev while it becomes the revision file.

    // From here to the `current` bump the revision must be published even
    // if cancellation was requested mid-commit.
    let _mask = cx.masked();

    // Remove the temporary txn props representing commit-time flags.
    let props = get_txn_props(fs, &txn_id)?;
    let mut doomed: Vec<(&str, Option<&str>)> = Vec::new();
    if props.contains_key(PROP_TXN_CHECK_OOD) {
        doomed.push((PROP_TXN_CHECK_OOD, None));
    }
    if props.contains_key(PROP_TXN_CHECK_LOCKS) {
        doomed.push((PROP_TXN_CHECK_LOCKS, None));
    }
    if !doomed.is_empty() {
        change_txn_props(fs, &txn_id, &doomed)?;
    }

    // Create the shard directories when this revision starts a new shard.
    if let Some(max) = fs.config().max_files_per_dir {
        if new_rev % max == 0 {
            for shard in [
                fs.layout().rev_shard(new_rev),
                fs.layout().revprops_shard(new_rev),
            ]
            .into_iter()
            .flatten()
            {
                match fs::create_dir(&shard) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(FsfsError::Io(e)),
                }
            }
        }
    }

    // Move the finished rev file into place, then release the proto-rev
    // lock: further writes would fail anyway, as the file no longer
    // exists.
    let old_rev_file = fs.layout().rev_file(old_rev);
    move_into_place(
        &fs.layout().txn_proto_rev(&txn_id),
        &fs.layout().rev_file(new_rev),
        &old_rev_file,
    )?;
    registry::unlock_proto_rev(cookie)?;

    // Refresh svn:date so revision datestamps stay non-decreasing.
    if set_timestamp {
        let date = now_timestamp();
        change_txn_props(fs, &txn_id, &[(PROP_REVISION_DATE, Some(date.as_str()))])?;
    }

    // Move the revprops into place and publish.
    move_into_place(
        &fs.layout().txn_props(&txn_id),
        &fs.layout().revprops_file(new_rev),
        &old_rev_file,
    )?;
    fs.write_current(new_rev)?;

    tracing::info!(rev = new_rev, txn = %txn_id, "commit published");

    // The new revision is durable and visible; nothing below changes
    // that.
    fs.purge_txn(&txn_id)?;

    *reps_out = walk.reps_to_cache;
    Ok(new_rev)
}

impl Txn<'_> {
    /// Commit this transaction, returning the new revision number.
    ///
    /// Serialized against other commits by the repository write lock. On
    /// `TxnOutOfDate` and other pre-publication failures the transaction
    /// is left intact and may be fixed up and re-committed.
    pub fn commit(&self, cx: &Cx) -> Result<Rev> {
        self.commit_opts(cx, true)
    }

    /// Commit, refreshing `svn:date` only when `set_timestamp` is set
    /// (otherwise the begin-time stamp is kept).
    pub fn commit_opts(&self, cx: &Cx, set_timestamp: bool) -> Result<Rev> {
        let fs = self.fs();
        let mut reps_to_cache = Vec::new();

        let new_rev = {
            let _mutex = fs.shared().write_lock_mutex.lock();
            let _lock = FileLock::acquire(&fs.layout().write_lock())?;
            commit_body(fs, cx, self, set_timestamp, &mut reps_to_cache)?
        };

        // Insert the new rep-cache rows outside the write lock; a failure
        // here must not un-succeed the commit.
        if fs.config().rep_sharing_allowed && !reps_to_cache.is_empty() {
            let inserted =
                fs.with_rep_cache(|cache| cache.set_rep_references(reps_to_cache.iter()));
            if let Err(e) = inserted {
                fs.warn(&e);
            }
        }

        Ok(new_rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_into_place_is_a_rename() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let perms_ref = dir.path().join("ref");
        fs::write(&src, b"payload").unwrap();
        fs::write(&perms_ref, b"").unwrap();

        move_into_place(&src, &dst, &perms_ref).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
    }
}
