//! Canonical on-disk paths, relative to the repository root.
//!
//! ```text
//! format                      repository format version
//! current                     "<rev>\n"
//! txn-current                 base-36 txn sequence counter
//! txn-current-lock            advisory lock sentinel
//! write-lock                  advisory lock sentinel for commits
//! rep-cache.db                sqlite rep-sharing index
//! revs/<N>                    immutable revision files
//! revprops/<N>                revision property hashes
//! txns/<TxnId>.txn/           transaction workspace
//! txn-protorevs/<TxnId>.rev   proto-rev append file
//! txn-protorevs/<TxnId>.rev-lock
//! locks/<digest>              path-lock entries
//! ```
//!
//! With `max_files_per_dir` set, `revs/` and `revprops/` gain one level of
//! sharding: `revs/<N / max>/<N>`.

use std::path::{Path, PathBuf};

use fsvn_types::{NodeRevId, Rev, TxnId};

/// Path construction for one repository.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    max_files_per_dir: Option<u64>,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, max_files_per_dir: Option<u64>) -> Self {
        Self {
            root: root.into(),
            max_files_per_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format_file(&self) -> PathBuf {
        self.root.join("format")
    }

    pub fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn txn_current(&self) -> PathBuf {
        self.root.join("txn-current")
    }

    pub fn txn_current_lock(&self) -> PathBuf {
        self.root.join("txn-current-lock")
    }

    pub fn write_lock(&self) -> PathBuf {
        self.root.join("write-lock")
    }

    pub fn rep_cache_db(&self) -> PathBuf {
        self.root.join("rep-cache.db")
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.root.join("revs")
    }

    pub fn revprops_dir(&self) -> PathBuf {
        self.root.join("revprops")
    }

    /// Shard subdirectory for `rev`, when sharding is enabled.
    pub fn rev_shard(&self, rev: Rev) -> Option<PathBuf> {
        self.max_files_per_dir
            .map(|max| self.revs_dir().join(format!("{}", rev / max)))
    }

    pub fn revprops_shard(&self, rev: Rev) -> Option<PathBuf> {
        self.max_files_per_dir
            .map(|max| self.revprops_dir().join(format!("{}", rev / max)))
    }

    pub fn rev_file(&self, rev: Rev) -> PathBuf {
        match self.rev_shard(rev) {
            Some(shard) => shard.join(format!("{rev}")),
            None => self.revs_dir().join(format!("{rev}")),
        }
    }

    pub fn revprops_file(&self, rev: Rev) -> PathBuf {
        match self.revprops_shard(rev) {
            Some(shard) => shard.join(format!("{rev}")),
            None => self.revprops_dir().join(format!("{rev}")),
        }
    }

    pub fn txns_dir(&self) -> PathBuf {
        self.root.join("txns")
    }

    pub fn txn_dir(&self, txn_id: &TxnId) -> PathBuf {
        self.txns_dir().join(format!("{txn_id}.txn"))
    }

    pub fn txn_props(&self, txn_id: &TxnId) -> PathBuf {
        self.txn_dir(txn_id).join("props")
    }

    pub fn txn_next_ids(&self, txn_id: &TxnId) -> PathBuf {
        self.txn_dir(txn_id).join("next-ids")
    }

    pub fn txn_changes(&self, txn_id: &TxnId) -> PathBuf {
        self.txn_dir(txn_id).join("changes")
    }

    pub fn protorevs_dir(&self) -> PathBuf {
        self.root.join("txn-protorevs")
    }

    pub fn txn_proto_rev(&self, txn_id: &TxnId) -> PathBuf {
        self.protorevs_dir().join(format!("{txn_id}.rev"))
    }

    pub fn txn_proto_rev_lock(&self, txn_id: &TxnId) -> PathBuf {
        self.protorevs_dir().join(format!("{txn_id}.rev-lock"))
    }

    /// Per-transaction node-revision file. The `<node>.<copy>` pair is
    /// unique within a transaction.
    pub fn txn_node_rev(&self, id: &NodeRevId) -> PathBuf {
        let txn = id.txn_id().expect("txn node paths require a txn id");
        self.txn_dir(txn)
            .join(format!("node.{}.{}", id.node_id, id.copy_id))
    }

    /// Mutable directory listing for a txn directory node.
    pub fn txn_node_children(&self, id: &NodeRevId) -> PathBuf {
        let mut path = self.txn_node_rev(id);
        path.set_file_name(format!("node.{}.{}.children", id.node_id, id.copy_id));
        path
    }

    /// Mutable property list for a txn node.
    pub fn txn_node_props(&self, id: &NodeRevId) -> PathBuf {
        let mut path = self.txn_node_rev(id);
        path.set_file_name(format!("node.{}.{}.props", id.node_id, id.copy_id));
        path
    }

    /// Intra-transaction sha1 → rep sidecar file.
    pub fn txn_sha1(&self, txn_id: &TxnId, sha1: &[u8; 20]) -> PathBuf {
        self.txn_dir(txn_id).join(hex::encode(sha1))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }
}
