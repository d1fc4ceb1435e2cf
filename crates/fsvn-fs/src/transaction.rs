//! Transaction lifecycle: begin, mutate, abort.
//!
//! A transaction id is allocated by atomically bumping the base-36
//! `txn-current` counter under its lock, so ids are unique for the
//! lifetime of the repository. The workspace starts with a root node-rev
//! cloned from the base revision's root (predecessor count bumped, copy
//! info cleared) and empty `changes`/proto-rev files; `next-ids` holds the
//! node/copy-id counters and always reflects the highest ids yet reserved.

use std::collections::BTreeMap;
use std::fs;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{
    hashfile, key36, Change, ChangeKind, Cx, NodeKind, NodeRev, NodeRevId, Rev, TxnId, REV_INVALID,
};

use crate::changes::add_change;
use crate::lock::FileLock;
use crate::registry;
use crate::rep::RepWriter;
use crate::repo::{now_timestamp, write_atomic, FsFs};
use crate::tree::{self, DirEntry};

/// Txn property holding the commit datestamp.
pub const PROP_REVISION_DATE: &str = "svn:date";
/// Flag property: reject the commit if the txn is out of date.
pub const PROP_TXN_CHECK_OOD: &str = "svn:check-ood";
/// Flag property: re-verify path locks during intermediate operations.
pub const PROP_TXN_CHECK_LOCKS: &str = "svn:check-locks";

/// Behaviors requested at `begin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnFlags {
    pub check_ood: bool,
    pub check_locks: bool,
}

/// Handle on an in-progress transaction.
#[derive(Debug)]
pub struct Txn<'a> {
    fs: &'a FsFs,
    id: TxnId,
    base_rev: Rev,
}

/// Atomically read and increment the `txn-current` sequence, returning
/// the pre-increment value.
fn get_and_increment_txn_key(fs: &FsFs) -> Result<String> {
    let _mutex = fs.shared().txn_current_mutex.lock();
    let _lock = FileLock::acquire(&fs.layout().txn_current_lock())?;

    let text = fs::read_to_string(fs.layout().txn_current()).map_err(FsfsError::Io)?;
    let current = text.trim();
    key36::validate(current)?;
    let next = key36::next_key(current)?;
    write_atomic(
        &fs.layout().txn_current(),
        format!("{next}\n").as_bytes(),
        false,
    )?;
    Ok(current.to_owned())
}

fn read_next_ids(fs: &FsFs, txn_id: &TxnId) -> Result<(String, String)> {
    let text = fs::read_to_string(fs.layout().txn_next_ids(txn_id)).map_err(FsfsError::Io)?;
    let line = text.trim_end_matches('\n');
    let (node, copy) = line
        .split_once(' ')
        .ok_or_else(|| FsfsError::corrupt("next-ids file corrupt"))?;
    key36::validate(node)?;
    key36::validate(copy)?;
    Ok((node.to_owned(), copy.to_owned()))
}

fn write_next_ids(fs: &FsFs, txn_id: &TxnId, node_id: &str, copy_id: &str) -> Result<()> {
    fs::write(
        fs.layout().txn_next_ids(txn_id),
        format!("{node_id} {copy_id}\n").as_bytes(),
    )
    .map_err(FsfsError::Io)
}

/// Reserve a node id unique to this transaction. Returns the previous
/// counter value with a `_` prefix marking it provisional.
pub(crate) fn get_new_txn_node_id(fs: &FsFs, txn_id: &TxnId) -> Result<String> {
    let (node, copy) = read_next_ids(fs, txn_id)?;
    write_next_ids(fs, txn_id, &key36::next_key(&node)?, &copy)?;
    Ok(format!("_{node}"))
}

/// Reserve a copy id unique to this transaction.
pub(crate) fn reserve_copy_id(fs: &FsFs, txn_id: &TxnId) -> Result<String> {
    let (node, copy) = read_next_ids(fs, txn_id)?;
    write_next_ids(fs, txn_id, &node, &key36::next_key(&copy)?)?;
    Ok(format!("_{copy}"))
}

/// Read the transaction's property list.
pub(crate) fn get_txn_props(fs: &FsFs, txn_id: &TxnId) -> Result<BTreeMap<String, String>> {
    match fs::read_to_string(fs.layout().txn_props(txn_id)) {
        Ok(text) => hashfile::read(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(FsfsError::Io(e)),
    }
}

/// Merge property changes (`None` deletes) and rewrite the props file
/// atomically.
pub(crate) fn change_txn_props(
    fs: &FsFs,
    txn_id: &TxnId,
    props: &[(&str, Option<&str>)],
) -> Result<()> {
    let mut all = get_txn_props(fs, txn_id)?;
    for (name, value) in props {
        match value {
            Some(v) => {
                all.insert((*name).to_owned(), (*v).to_owned());
            }
            None => {
                all.remove(*name);
            }
        }
    }
    write_atomic(
        &fs.layout().txn_props(txn_id),
        hashfile::write(&all).as_bytes(),
        false,
    )
}

/// Write the sha1 → rep sidecar for a node's data rep so later writes in
/// the same transaction can share it before it ever reaches the rep-cache.
pub(crate) fn store_sha1_rep_mapping(fs: &FsFs, noderev: &NodeRev) -> Result<()> {
    if !fs.config().rep_sharing_allowed {
        return Ok(());
    }
    let Some(rep) = &noderev.data_rep else {
        return Ok(());
    };
    let Some(sha1) = rep.sha1 else {
        return Ok(());
    };
    let txn_id = noderev
        .id
        .txn_id()
        .ok_or_else(|| FsfsError::corrupt("sha1 mapping requires a txn node"))?;
    fs::write(
        fs.layout().txn_sha1(txn_id, &sha1),
        format!("{rep}\n").as_bytes(),
    )
    .map_err(FsfsError::Io)
}

impl FsFs {
    /// Begin a transaction based on revision `rev`.
    pub fn begin_txn(&self, rev: Rev, flags: TxnFlags) -> Result<Txn<'_>> {
        let youngest = self.youngest_rev()?;
        if rev > youngest {
            return Err(FsfsError::NoSuchRevision { rev });
        }

        let seq = get_and_increment_txn_key(self)?;
        let txn_id = TxnId::new(rev, seq);

        fs::create_dir(self.layout().txn_dir(&txn_id)).map_err(FsfsError::Io)?;
        fs::write(self.layout().txn_changes(&txn_id), b"").map_err(FsfsError::Io)?;
        fs::write(self.layout().txn_proto_rev(&txn_id), b"").map_err(FsfsError::Io)?;
        fs::write(self.layout().txn_proto_rev_lock(&txn_id), b"").map_err(FsfsError::Io)?;
        write_next_ids(self, &txn_id, "0", "0")?;

        // Root node-rev: successor of the base revision's root.
        let base_root = self.node_rev(&self.rev_root_id(rev)?)?;
        if base_root.id.is_txn() {
            return Err(FsfsError::corrupt("copying from transactions not allowed"));
        }
        let mut root = base_root.clone();
        root.predecessor_id = Some(base_root.id.clone());
        root.predecessor_count += 1;
        root.copyfrom = None;
        root.id = tree::txn_root_id(&txn_id);
        root.is_fresh_txn_root = true;
        tree::put_node_rev(self, &root)?;

        // Datestamp so abandoned transactions can be aged out, plus the
        // requested flag props.
        let date = now_timestamp();
        let mut props: Vec<(&str, Option<&str>)> = vec![(PROP_REVISION_DATE, Some(date.as_str()))];
        if flags.check_ood {
            props.push((PROP_TXN_CHECK_OOD, Some("true")));
        }
        if flags.check_locks {
            props.push((PROP_TXN_CHECK_LOCKS, Some("true")));
        }
        change_txn_props(self, &txn_id, &props)?;

        tracing::debug!(txn = %txn_id, base_rev = rev, "transaction created");
        Ok(Txn {
            fs: self,
            id: txn_id,
            base_rev: rev,
        })
    }

    /// Open an existing transaction by name.
    pub fn open_txn(&self, name: &str) -> Result<Txn<'_>> {
        let txn_id: TxnId = name.parse().map_err(|_| FsfsError::NoSuchTransaction {
            name: name.to_owned(),
        })?;
        if !self.layout().txn_dir(&txn_id).is_dir() {
            return Err(FsfsError::NoSuchTransaction {
                name: name.to_owned(),
            });
        }
        Ok(Txn {
            fs: self,
            base_rev: txn_id.base_rev(),
            id: txn_id,
        })
    }

    /// Names of all transactions with a workspace on disk.
    pub fn list_txns(&self) -> Result<Vec<TxnId>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.layout().txns_dir()).map_err(FsfsError::Io)? {
            let entry = entry.map_err(FsfsError::Io)?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".txn")) else {
                continue;
            };
            if let Ok(txn_id) = stem.parse() {
                names.push(txn_id);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove every trace of a transaction: the in-process record, the
    /// workspace directory, and the out-of-tree proto-rev files (which may
    /// already be gone after a commit).
    pub fn purge_txn(&self, txn_id: &TxnId) -> Result<()> {
        registry::forget_txn(self.shared(), txn_id);
        match fs::remove_dir_all(self.layout().txn_dir(txn_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsfsError::NoSuchTransaction {
                    name: txn_id.to_string(),
                });
            }
            Err(e) => return Err(FsfsError::Io(e)),
        }
        for path in [
            self.layout().txn_proto_rev(txn_id),
            self.layout().txn_proto_rev_lock(txn_id),
        ] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsfsError::Io(e)),
            }
        }
        tracing::debug!(txn = %txn_id, "transaction purged");
        Ok(())
    }
}

impl<'a> Txn<'a> {
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    pub fn base_rev(&self) -> Rev {
        self.base_rev
    }

    pub(crate) fn fs(&self) -> &'a FsFs {
        self.fs
    }

    /// The transaction's root node-rev.
    pub fn root(&self) -> Result<NodeRev> {
        self.fs.node_rev(&tree::txn_root_id(&self.id))
    }

    /// The node at `path` as this transaction sees it.
    pub fn node_at(&self, path: &str) -> Result<NodeRev> {
        tree::lookup_from(self.fs, &tree::txn_root_id(&self.id), path)
    }

    /// Transaction properties.
    pub fn proplist(&self) -> Result<BTreeMap<String, String>> {
        get_txn_props(self.fs, &self.id)
    }

    /// Set (`Some`) or delete (`None`) one transaction property.
    pub fn change_prop(&self, name: &str, value: Option<&str>) -> Result<()> {
        change_txn_props(self.fs, &self.id, &[(name, value)])
    }

    /// Create an empty file at `path`.
    pub fn make_file(&self, cx: &Cx, path: &str) -> Result<()> {
        self.make_node(cx, path, NodeKind::File)
    }

    /// Create an empty directory at `path`.
    pub fn make_dir(&self, cx: &Cx, path: &str) -> Result<()> {
        self.make_node(cx, path, NodeKind::Dir)
    }

    fn make_node(&self, cx: &Cx, path: &str, kind: NodeKind) -> Result<()> {
        cx.checkpoint()?;
        let (parent_path, name) = tree::split_parent(path)?;
        let mut parent = tree::make_path_mutable(self.fs, &self.id, parent_path)?;
        if tree::dir_entries(self.fs, &parent)?.contains_key(name) {
            return Err(FsfsError::AlreadyExists {
                path: path.to_owned(),
            });
        }

        let node_id = get_new_txn_node_id(self.fs, &self.id)?;
        let id = NodeRevId::txn(node_id, "0", self.id.clone());
        let noderev = NodeRev {
            id: id.clone(),
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: path.to_owned(),
            copyfrom: None,
            copyroot_rev: REV_INVALID,
            copyroot_path: path.to_owned(),
            is_fresh_txn_root: false,
        };
        tree::put_node_rev(self.fs, &noderev)?;
        tree::set_entry(
            self.fs,
            &self.id,
            &mut parent,
            name,
            Some(DirEntry {
                kind,
                id: id.clone(),
            }),
        )?;

        add_change(
            self.fs.layout(),
            &self.id,
            &Change {
                path: path.to_owned(),
                noderev_id: Some(id),
                kind: ChangeKind::Add,
                node_kind: Some(kind),
                text_mod: false,
                prop_mod: false,
                copyfrom: None,
            },
        )
    }

    /// Open a streaming writer replacing the contents of the file at
    /// `path`. The change is recorded when the writer is opened; closing
    /// the writer finalizes the representation.
    pub fn apply_text(&self, cx: &Cx, path: &str) -> Result<RepWriter<'a>> {
        cx.checkpoint()?;
        let noderev = tree::make_node_mutable(self.fs, &self.id, path)?;
        if noderev.kind != NodeKind::File {
            return Err(FsfsError::NotFile {
                path: path.to_owned(),
            });
        }
        add_change(
            self.fs.layout(),
            &self.id,
            &Change {
                path: path.to_owned(),
                noderev_id: Some(noderev.id.clone()),
                kind: ChangeKind::Modify,
                node_kind: Some(NodeKind::File),
                text_mod: true,
                prop_mod: false,
                copyfrom: None,
            },
        )?;
        RepWriter::new(self.fs, cx, noderev)
    }

    /// Convenience wrapper: write `contents` as the file's new text.
    pub fn set_file_contents(&self, cx: &Cx, path: &str, contents: &[u8]) -> Result<()> {
        let mut writer = self.apply_text(cx, path)?;
        writer.write(contents)?;
        writer.close()?;
        Ok(())
    }

    /// Set (`Some`) or delete (`None`) one node property at `path`.
    pub fn change_node_prop(
        &self,
        cx: &Cx,
        path: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<()> {
        cx.checkpoint()?;
        let mut noderev = tree::make_node_mutable(self.fs, &self.id, path)?;
        let mut props = tree::node_props(self.fs, &noderev)?;
        match value {
            Some(v) => {
                props.insert(name.to_owned(), v.to_owned());
            }
            None => {
                props.remove(name);
            }
        }
        tree::set_proplist(self.fs, &self.id, &mut noderev, &props)?;

        add_change(
            self.fs.layout(),
            &self.id,
            &Change {
                path: path.to_owned(),
                noderev_id: Some(noderev.id.clone()),
                kind: ChangeKind::Modify,
                node_kind: Some(noderev.kind),
                text_mod: false,
                prop_mod: true,
                copyfrom: None,
            },
        )
    }

    /// Delete the node at `path`.
    pub fn delete(&self, cx: &Cx, path: &str) -> Result<()> {
        cx.checkpoint()?;
        let (parent_path, name) = tree::split_parent(path)?;
        let mut parent = tree::make_path_mutable(self.fs, &self.id, parent_path)?;
        let entries = tree::dir_entries(self.fs, &parent)?;
        let entry = entries.get(name).ok_or_else(|| FsfsError::NoSuchNode {
            path: path.to_owned(),
        })?;
        let doomed_id = entry.id.clone();
        let doomed_kind = entry.kind;

        tree::set_entry(self.fs, &self.id, &mut parent, name, None)?;
        if doomed_id.is_txn() {
            tree::delete_node_rev_files(self.fs, &doomed_id)?;
        }

        add_change(
            self.fs.layout(),
            &self.id,
            &Change {
                path: path.to_owned(),
                noderev_id: Some(doomed_id),
                kind: ChangeKind::Delete,
                node_kind: Some(doomed_kind),
                text_mod: false,
                prop_mod: false,
                copyfrom: None,
            },
        )
    }

    /// Reserve a provisional node id (`_<seq>`), unique to this
    /// transaction.
    pub fn reserve_node_id(&self) -> Result<String> {
        get_new_txn_node_id(self.fs, &self.id)
    }

    /// Reserve a provisional copy id (`_<seq>`), unique to this
    /// transaction.
    pub fn reserve_copy_id(&self) -> Result<String> {
        reserve_copy_id(self.fs, &self.id)
    }

    /// Abort the transaction, removing its workspace without effect on
    /// the history.
    pub fn abort(self) -> Result<()> {
        self.fs.purge_txn(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsConfig;

    fn test_fs() -> (tempfile::TempDir, FsFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FsFs::create(dir.path().join("repo"), FsConfig::default()).unwrap();
        (dir, fs)
    }

    #[test]
    fn begin_creates_workspace() {
        let (_dir, fs) = test_fs();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();

        assert_eq!(txn.id().to_string(), "0-0");
        assert!(fs.layout().txn_dir(txn.id()).is_dir());
        assert!(fs.layout().txn_proto_rev(txn.id()).is_file());
        assert!(fs.layout().txn_proto_rev_lock(txn.id()).is_file());
        assert_eq!(
            std::fs::read_to_string(fs.layout().txn_next_ids(txn.id())).unwrap(),
            "0 0\n"
        );

        let root = txn.root().unwrap();
        assert!(root.is_fresh_txn_root);
        assert_eq!(root.predecessor_count, 1);
        assert!(root.copyfrom.is_none());

        let props = txn.proplist().unwrap();
        assert!(props.contains_key(PROP_REVISION_DATE));
    }

    #[test]
    fn txn_ids_are_unique_and_monotonic() {
        let (_dir, fs) = test_fs();
        let t1 = fs.begin_txn(0, TxnFlags::default()).unwrap();
        let t2 = fs.begin_txn(0, TxnFlags::default()).unwrap();
        assert_ne!(t1.id(), t2.id());
        assert_eq!(t1.id().to_string(), "0-0");
        assert_eq!(t2.id().to_string(), "0-1");
        assert_eq!(
            std::fs::read_to_string(fs.layout().txn_current()).unwrap(),
            "2\n"
        );
    }

    #[test]
    fn parallel_begins_produce_distinct_ids() {
        let (_dir, fs) = test_fs();
        let fs = std::sync::Arc::new(fs);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let fs = std::sync::Arc::clone(&fs);
            handles.push(std::thread::spawn(move || {
                fs.begin_txn(0, TxnFlags::default())
                    .unwrap()
                    .id()
                    .to_string()
            }));
        }
        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "txn ids must be distinct");
    }

    #[test]
    fn flag_props_recorded() {
        let (_dir, fs) = test_fs();
        let txn = fs
            .begin_txn(
                0,
                TxnFlags {
                    check_ood: true,
                    check_locks: true,
                },
            )
            .unwrap();
        let props = txn.proplist().unwrap();
        assert_eq!(props.get(PROP_TXN_CHECK_OOD).map(String::as_str), Some("true"));
        assert_eq!(
            props.get(PROP_TXN_CHECK_LOCKS).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn begin_past_youngest_fails() {
        let (_dir, fs) = test_fs();
        assert!(matches!(
            fs.begin_txn(3, TxnFlags::default()),
            Err(FsfsError::NoSuchRevision { rev: 3 })
        ));
    }

    #[test]
    fn reserve_ids_are_provisional_and_monotonic() {
        let (_dir, fs) = test_fs();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        // Creating the workspace does not consume ids.
        let a = get_new_txn_node_id(&fs, txn.id()).unwrap();
        let b = get_new_txn_node_id(&fs, txn.id()).unwrap();
        let c = reserve_copy_id(&fs, txn.id()).unwrap();
        assert_eq!(a, "_0");
        assert_eq!(b, "_1");
        assert_eq!(c, "_0");
        assert_eq!(
            std::fs::read_to_string(fs.layout().txn_next_ids(txn.id())).unwrap(),
            "2 1\n"
        );
    }

    #[test]
    fn make_file_and_read_back_in_txn() {
        let (_dir, fs) = test_fs();
        let cx = Cx::new();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        txn.make_dir(&cx, "/d").unwrap();
        txn.make_file(&cx, "/d/a").unwrap();
        txn.set_file_contents(&cx, "/d/a", b"hello\n").unwrap();

        let node = txn.node_at("/d/a").unwrap();
        assert_eq!(node.kind, NodeKind::File);
        let rep = node.data_rep.as_ref().unwrap();
        assert!(rep.is_txn());
        assert_eq!(rep.expanded_size, 6);
        let content = crate::rep::rep_contents(&fs, rep).unwrap();
        assert_eq!(content, b"hello\n");
    }

    #[test]
    fn make_file_twice_fails() {
        let (_dir, fs) = test_fs();
        let cx = Cx::new();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        txn.make_file(&cx, "/a").unwrap();
        assert!(matches!(
            txn.make_file(&cx, "/a"),
            Err(FsfsError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn delete_removes_entry_and_records_change() {
        let (_dir, fs) = test_fs();
        let cx = Cx::new();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        txn.make_file(&cx, "/a").unwrap();
        txn.delete(&cx, "/a").unwrap();
        assert!(matches!(
            txn.node_at("/a"),
            Err(FsfsError::NoSuchNode { .. })
        ));
        // add + delete of an in-txn node folds to nothing.
        let folded = crate::changes::fetch(&cx, fs.layout(), txn.id()).unwrap();
        assert!(folded.is_empty());
    }

    #[test]
    fn abort_purges_workspace() {
        let (_dir, fs) = test_fs();
        let cx = Cx::new();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        txn.make_file(&cx, "/a").unwrap();
        let id = txn.id().clone();
        let dir = fs.layout().txn_dir(&id);
        let proto = fs.layout().txn_proto_rev(&id);
        assert!(dir.is_dir());
        txn.abort().unwrap();
        assert!(!dir.exists());
        assert!(!proto.exists());
        assert!(matches!(
            fs.open_txn(&id.to_string()),
            Err(FsfsError::NoSuchTransaction { .. })
        ));
    }

    #[test]
    fn open_and_list_txns() {
        let (_dir, fs) = test_fs();
        let t1 = fs.begin_txn(0, TxnFlags::default()).unwrap();
        let listed = fs.list_txns().unwrap();
        assert_eq!(listed, vec![t1.id().clone()]);
        let reopened = fs.open_txn(&t1.id().to_string()).unwrap();
        assert_eq!(reopened.base_rev(), 0);
        assert!(matches!(
            fs.open_txn("9-zz"),
            Err(FsfsError::NoSuchTransaction { .. })
        ));
    }

    #[test]
    fn node_prop_changes_round_trip() {
        let (_dir, fs) = test_fs();
        let cx = Cx::new();
        let txn = fs.begin_txn(0, TxnFlags::default()).unwrap();
        txn.make_file(&cx, "/a").unwrap();
        txn.change_node_prop(&cx, "/a", "svn:mime-type", Some("text/plain"))
            .unwrap();
        let node = txn.node_at("/a").unwrap();
        let props = tree::node_props(&fs, &node).unwrap();
        assert_eq!(props.get("svn:mime-type").map(String::as_str), Some("text/plain"));

        txn.change_node_prop(&cx, "/a", "svn:mime-type", None).unwrap();
        let node = txn.node_at("/a").unwrap();
        assert!(tree::node_props(&fs, &node).unwrap().is_empty());
    }
}
