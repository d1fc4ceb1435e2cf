//! Mutable-tree plumbing for transactions.
//!
//! Nodes of an in-progress transaction live as individual files in the
//! transaction workspace: a `node.<id>` file per node-revision, a
//! `.children` file holding a mutable directory listing (full dump plus
//! incremental `K`/`V`/`D` records), and a `.props` file per node with
//! modified properties. Committed nodes reached through entries stay
//! committed until a mutation clones them into the transaction
//! (copy-on-write successor creation).

use std::collections::BTreeMap;
use std::io::Write as _;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{
    hashfile, NodeKind, NodeRev, NodeRevId, RepOrigin, Representation, TxnId,
};

use crate::repo::{open_append, FsFs};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub kind: NodeKind,
    pub id: NodeRevId,
}

pub(crate) fn unparse_dir_entry(entry: &DirEntry) -> String {
    format!("{} {}", entry.kind.as_str(), entry.id)
}

pub(crate) fn parse_dir_entry(value: &str) -> Result<DirEntry> {
    let (kind, id) = value
        .split_once(' ')
        .ok_or_else(|| FsfsError::corrupt(format!("malformed directory entry '{value}'")))?;
    Ok(DirEntry {
        kind: kind.parse()?,
        id: id.parse()?,
    })
}

/// Split `/a/b/c` into its components.
pub(crate) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Split a canonical path into `(parent, basename)`.
pub(crate) fn split_parent(path: &str) -> Result<(&str, &str)> {
    if path == "/" {
        return Err(FsfsError::corrupt("the root directory has no parent"));
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Ok(("/", &trimmed[1..])),
        Some(i) => Ok((&trimmed[..i], &trimmed[i + 1..])),
        None => Err(FsfsError::corrupt(format!("non-canonical path '{path}'"))),
    }
}

/// The root node-rev id of a transaction. The root is cloned into the
/// workspace at `begin`, so it is always mutable.
pub(crate) fn txn_root_id(txn_id: &TxnId) -> NodeRevId {
    NodeRevId::txn("0", "0", txn_id.clone())
}

/// Write a mutable node-revision to its workspace file.
pub(crate) fn put_node_rev(fs: &FsFs, noderev: &NodeRev) -> Result<()> {
    if !noderev.id.is_txn() {
        return Err(FsfsError::corrupt(format!(
            "attempted to write to non-transaction node '{}'",
            noderev.id
        )));
    }
    std::fs::write(
        fs.layout().txn_node_rev(&noderev.id),
        noderev.unparse().as_bytes(),
    )
    .map_err(FsfsError::Io)
}

/// Remove the workspace files of a mutable node (shallow).
pub(crate) fn delete_node_rev_files(fs: &FsFs, id: &NodeRevId) -> Result<()> {
    for path in [
        fs.layout().txn_node_rev(id),
        fs.layout().txn_node_children(id),
        fs.layout().txn_node_props(id),
    ] {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsfsError::Io(e)),
        }
    }
    Ok(())
}

/// The entry listing of a directory node, mutable or committed.
pub fn dir_entries(fs: &FsFs, noderev: &NodeRev) -> Result<BTreeMap<String, DirEntry>> {
    if noderev.kind != NodeKind::Dir {
        return Err(FsfsError::NotDirectory {
            path: noderev.created_path.clone(),
        });
    }
    let Some(rep) = &noderev.data_rep else {
        return Ok(BTreeMap::new());
    };

    let raw = if rep.is_txn() {
        match std::fs::read_to_string(fs.layout().txn_node_children(&noderev.id)) {
            Ok(text) => {
                let (map, _) = hashfile::read_fold(&text)?;
                map
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsfsError::corrupt(format!(
                    "mutable directory '{}' has no children file",
                    noderev.id
                )));
            }
            Err(e) => return Err(FsfsError::Io(e)),
        }
    } else {
        let text = crate::rep::rep_contents(fs, rep)?;
        let text = String::from_utf8(text)
            .map_err(|_| FsfsError::corrupt("directory listing is not valid UTF-8"))?;
        hashfile::read(&text)?
    };

    let mut entries = BTreeMap::new();
    for (name, value) in raw {
        entries.insert(name, parse_dir_entry(&value)?);
    }
    Ok(entries)
}

/// Set or delete one entry of a mutable directory.
///
/// On the first mutation the committed listing is dumped into the
/// `.children` file and the directory's data rep is replaced by a mutable
/// marker; afterwards each call appends one incremental record.
pub(crate) fn set_entry(
    fs: &FsFs,
    txn_id: &TxnId,
    parent: &mut NodeRev,
    name: &str,
    entry: Option<DirEntry>,
) -> Result<()> {
    if parent.kind != NodeKind::Dir {
        return Err(FsfsError::NotDirectory {
            path: parent.created_path.clone(),
        });
    }
    if !parent.id.is_txn() {
        return Err(FsfsError::corrupt(format!(
            "attempted to change entries of committed node '{}'",
            parent.id
        )));
    }

    let is_mutable = parent.data_rep.as_ref().is_some_and(Representation::is_txn);
    if !is_mutable {
        // Dump the old contents into the mutable listing file.
        let entries = dir_entries(fs, parent)?;
        let mut dump = String::new();
        for (n, e) in &entries {
            hashfile::push_entry(&mut dump, n, &unparse_dir_entry(e));
        }
        std::fs::write(fs.layout().txn_node_children(&parent.id), dump.as_bytes())
            .map_err(FsfsError::Io)?;

        let suffix = crate::transaction::get_new_txn_node_id(fs, txn_id)?;
        parent.data_rep = Some(Representation {
            origin: RepOrigin::Txn(txn_id.clone()),
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
            sha1: None,
            uniquifier: Some(format!("{txn_id}/{suffix}")),
        });
        put_node_rev(fs, parent)?;
    }

    let mut record = String::new();
    match entry {
        Some(e) => hashfile::push_entry(&mut record, name, &unparse_dir_entry(&e)),
        None => hashfile::push_deletion(&mut record, name),
    }
    open_append(&fs.layout().txn_node_children(&parent.id))?
        .write_all(record.as_bytes())
        .map_err(FsfsError::Io)
}

/// Walk `path` starting from `root_id`, which may be a committed root or
/// a transaction root.
pub(crate) fn lookup_from(fs: &FsFs, root_id: &NodeRevId, path: &str) -> Result<NodeRev> {
    let mut cur = fs.node_rev(root_id)?;
    for comp in components(path) {
        if cur.kind != NodeKind::Dir {
            return Err(FsfsError::NotDirectory {
                path: cur.created_path.clone(),
            });
        }
        let entries = dir_entries(fs, &cur)?;
        let entry = entries.get(comp).ok_or_else(|| FsfsError::NoSuchNode {
            path: path.to_owned(),
        })?;
        cur = fs.node_rev(&entry.id)?;
    }
    Ok(cur)
}

/// Clone a committed node into the transaction as a successor: same node
/// and copy ids, origin moved into the txn, predecessor chain extended.
fn clone_into_txn(
    fs: &FsFs,
    txn_id: &TxnId,
    parent: &mut NodeRev,
    name: &str,
    child: &NodeRev,
) -> Result<NodeRev> {
    let new_id = NodeRevId::txn(
        child.id.node_id.clone(),
        child.id.copy_id.clone(),
        txn_id.clone(),
    );
    let mut clone = child.clone();
    clone.predecessor_id = Some(child.id.clone());
    clone.predecessor_count += 1;
    clone.copyfrom = None;
    clone.id = new_id.clone();
    put_node_rev(fs, &clone)?;
    set_entry(
        fs,
        txn_id,
        parent,
        name,
        Some(DirEntry {
            kind: clone.kind,
            id: new_id,
        }),
    )?;
    Ok(clone)
}

/// Make every directory along `dir_path` mutable and return the last one.
pub(crate) fn make_path_mutable(fs: &FsFs, txn_id: &TxnId, dir_path: &str) -> Result<NodeRev> {
    let mut cur = fs.node_rev(&txn_root_id(txn_id))?;
    for comp in components(dir_path) {
        if cur.kind != NodeKind::Dir {
            return Err(FsfsError::NotDirectory {
                path: cur.created_path.clone(),
            });
        }
        let entries = dir_entries(fs, &cur)?;
        let entry = entries.get(comp).ok_or_else(|| FsfsError::NoSuchNode {
            path: dir_path.to_owned(),
        })?;
        let child = fs.node_rev(&entry.id)?;
        if child.kind != NodeKind::Dir {
            return Err(FsfsError::NotDirectory {
                path: child.created_path.clone(),
            });
        }
        cur = if child.id.is_txn() {
            child
        } else {
            clone_into_txn(fs, txn_id, &mut cur, comp, &child)?
        };
    }
    Ok(cur)
}

/// Ensure the node at `path` is mutable, cloning it (and every directory
/// above it) into the transaction if necessary.
pub(crate) fn make_node_mutable(fs: &FsFs, txn_id: &TxnId, path: &str) -> Result<NodeRev> {
    if path == "/" {
        return fs.node_rev(&txn_root_id(txn_id));
    }
    let (parent_path, name) = split_parent(path)?;
    let mut parent = make_path_mutable(fs, txn_id, parent_path)?;
    let entries = dir_entries(fs, &parent)?;
    let entry = entries.get(name).ok_or_else(|| FsfsError::NoSuchNode {
        path: path.to_owned(),
    })?;
    let child = fs.node_rev(&entry.id)?;
    if child.id.is_txn() {
        Ok(child)
    } else {
        clone_into_txn(fs, txn_id, &mut parent, name, &child)
    }
}

/// Property list of a node, mutable or committed.
pub fn node_props(fs: &FsFs, noderev: &NodeRev) -> Result<BTreeMap<String, String>> {
    let Some(rep) = &noderev.prop_rep else {
        return Ok(BTreeMap::new());
    };
    if rep.is_txn() {
        let text = std::fs::read_to_string(fs.layout().txn_node_props(&noderev.id))
            .map_err(FsfsError::Io)?;
        hashfile::read(&text)
    } else {
        let bytes = crate::rep::rep_contents(fs, rep)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| FsfsError::corrupt("property list is not valid UTF-8"))?;
        hashfile::read(&text)
    }
}

/// Replace the property list of a mutable node.
pub(crate) fn set_proplist(
    fs: &FsFs,
    txn_id: &TxnId,
    noderev: &mut NodeRev,
    props: &BTreeMap<String, String>,
) -> Result<()> {
    if !noderev.id.is_txn() {
        return Err(FsfsError::corrupt(format!(
            "attempted to set properties of committed node '{}'",
            noderev.id
        )));
    }
    std::fs::write(
        fs.layout().txn_node_props(&noderev.id),
        hashfile::write(props).as_bytes(),
    )
    .map_err(FsfsError::Io)?;

    if !noderev.prop_rep.as_ref().is_some_and(Representation::is_txn) {
        let suffix = crate::transaction::get_new_txn_node_id(fs, txn_id)?;
        noderev.prop_rep = Some(Representation {
            origin: RepOrigin::Txn(txn_id.clone()),
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: [0; 16],
            sha1: None,
            uniquifier: Some(format!("{txn_id}/{suffix}")),
        });
        put_node_rev(fs, noderev)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_roundtrip() {
        let entry = DirEntry {
            kind: NodeKind::File,
            id: NodeRevId::committed("3-2", "0", 2, 160),
        };
        let text = unparse_dir_entry(&entry);
        assert_eq!(text, "file 3-2.0.r2/160");
        assert_eq!(parse_dir_entry(&text).unwrap(), entry);
        assert!(parse_dir_entry("file").is_err());
        assert!(parse_dir_entry("bogus 0.0.r0/0").is_err());
    }

    #[test]
    fn path_components() {
        let comps: Vec<_> = components("/a/b/c").collect();
        assert_eq!(comps, ["a", "b", "c"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn split_parent_basics() {
        assert_eq!(split_parent("/a").unwrap(), ("/", "a"));
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b", "c"));
        assert!(split_parent("/").is_err());
    }
}
