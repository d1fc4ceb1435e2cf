//! Repository open/create, the `current` pointer, and the committed read
//! side.
//!
//! A revision file holds node-revisions and representations at byte
//! offsets, a changed-paths block, and a final trailer line
//! `"<root_offset> <changed_paths_offset>\n"`. Readers locate everything
//! from the trailer; the youngest revision is defined solely by the
//! `current` file, never by directory listings (a crashed commit may
//! leave a stray `revs/<N>` that is not yet visible).

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{hashfile, Change, IdOrigin, NodeKind, NodeRev, NodeRevId, Rev};
use parking_lot::Mutex;

use crate::layout::Layout;
use crate::registry::{self, SharedFsData};
use crate::rep_cache::RepCache;
use crate::FsConfig;

/// Repository format this library reads and writes.
pub const FORMAT_NUMBER: u32 = 1;

/// Commit-time identity: the user and the lock tokens they present.
#[derive(Debug, Clone, Default)]
pub struct FsAccess {
    pub username: String,
    pub tokens: HashSet<String>,
}

type WarningFn = Box<dyn Fn(&FsfsError) + Send + Sync>;

/// An open repository.
pub struct FsFs {
    layout: Layout,
    config: FsConfig,
    shared: Arc<SharedFsData>,
    rep_cache: Mutex<Option<RepCache>>,
    access: Mutex<Option<FsAccess>>,
    warning: WarningFn,
}

impl std::fmt::Debug for FsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsFs")
            .field("root", &self.layout.root())
            .finish_non_exhaustive()
    }
}

/// Write `contents` to `path` via a temp file in the same directory plus
/// rename. With `durable`, fsync the file before and the directory after
/// the rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8], durable: bool) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FsfsError::corrupt(format!("bad target path '{}'", path.display())))?;
    let parent = path
        .parent()
        .ok_or_else(|| FsfsError::corrupt(format!("bad target path '{}'", path.display())))?;
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = File::create(&tmp).map_err(FsfsError::Io)?;
    file.write_all(contents).map_err(FsfsError::Io)?;
    if durable {
        file.sync_all().map_err(FsfsError::Io)?;
    }
    drop(file);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(FsfsError::Io(e));
    }
    if durable {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// fsync a directory so a rename inside it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(FsfsError::Io)
}

impl FsFs {
    /// Create a new repository at `path` and bootstrap revision 0 (the
    /// empty root directory).
    pub fn create(path: impl Into<PathBuf>, config: FsConfig) -> Result<Self> {
        let root: PathBuf = path.into();
        let layout = Layout::new(&root, config.max_files_per_dir);

        if layout.format_file().exists() {
            return Err(FsfsError::AlreadyExists {
                path: root.display().to_string(),
            });
        }
        fs::create_dir_all(&root).map_err(FsfsError::Io)?;
        for dir in [
            layout.revs_dir(),
            layout.revprops_dir(),
            layout.txns_dir(),
            layout.protorevs_dir(),
            layout.locks_dir(),
        ] {
            fs::create_dir_all(dir).map_err(FsfsError::Io)?;
        }
        if let Some(shard) = layout.rev_shard(0) {
            fs::create_dir_all(shard).map_err(FsfsError::Io)?;
        }
        if let Some(shard) = layout.revprops_shard(0) {
            fs::create_dir_all(shard).map_err(FsfsError::Io)?;
        }

        // Lock sentinels.
        fs::write(layout.write_lock(), b"").map_err(FsfsError::Io)?;
        fs::write(layout.txn_current_lock(), b"").map_err(FsfsError::Io)?;

        // Revision 0: an empty root directory and an empty changed-paths
        // block.
        let root_noderev = NodeRev {
            id: NodeRevId::committed("0", "0", 0, 0),
            kind: NodeKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            data_rep: None,
            prop_rep: None,
            created_path: "/".to_owned(),
            copyfrom: None,
            copyroot_rev: 0,
            copyroot_path: "/".to_owned(),
            is_fresh_txn_root: false,
        };
        let mut rev0 = root_noderev.unparse();
        rev0.push('\n');
        let cp_offset = rev0.len();
        rev0.push_str(&format!("0 {cp_offset}\n"));
        write_atomic(&layout.rev_file(0), rev0.as_bytes(), true)?;

        let mut revprops = BTreeMap::new();
        revprops.insert("svn:date".to_owned(), now_timestamp());
        write_atomic(
            &layout.revprops_file(0),
            hashfile::write(&revprops).as_bytes(),
            true,
        )?;

        write_atomic(layout.txn_current().as_path(), b"0\n", true)?;
        write_atomic(layout.current().as_path(), b"0\n", true)?;
        write_atomic(
            layout.format_file().as_path(),
            format!("{FORMAT_NUMBER}\n").as_bytes(),
            true,
        )?;

        tracing::info!(root = %root.display(), "repository created");
        Self::open(root, config)
    }

    /// Open an existing repository.
    pub fn open(path: impl Into<PathBuf>, config: FsConfig) -> Result<Self> {
        let root: PathBuf = path.into();
        let layout = Layout::new(&root, config.max_files_per_dir);

        let format_text = match fs::read_to_string(layout.format_file()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsfsError::RepositoryNotFound { path: root });
            }
            Err(e) => return Err(FsfsError::Io(e)),
        };
        let format: u32 = format_text
            .trim()
            .parse()
            .map_err(|_| FsfsError::corrupt(format!("malformed format file '{format_text}'")))?;
        if format > FORMAT_NUMBER {
            return Err(FsfsError::UnsupportedFormat {
                format,
                supported: FORMAT_NUMBER,
            });
        }

        let shared = registry::shared_data_for(&root)?;
        Ok(Self {
            layout,
            config,
            shared,
            rep_cache: Mutex::new(None),
            access: Mutex::new(None),
            warning: Box::new(|err| tracing::warn!(error = %err, "fs warning")),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub(crate) fn shared(&self) -> &Arc<SharedFsData> {
        &self.shared
    }

    /// Replace the warning callback (non-fatal rep-cache trouble, cleanup
    /// failures on error paths).
    pub fn set_warning_callback(&mut self, warning: WarningFn) {
        self.warning = warning;
    }

    pub(crate) fn warn(&self, err: &FsfsError) {
        (self.warning)(err);
    }

    /// Set the identity used for commit-time lock verification.
    pub fn set_access(&self, access: Option<FsAccess>) {
        *self.access.lock() = access;
    }

    pub(crate) fn access(&self) -> Option<FsAccess> {
        self.access.lock().clone()
    }

    // -----------------------------------------------------------------
    // The `current` pointer
    // -----------------------------------------------------------------

    /// The youngest committed revision, read from `current`.
    pub fn youngest_rev(&self) -> Result<Rev> {
        let text = fs::read_to_string(self.layout.current()).map_err(FsfsError::Io)?;
        let rev: Rev = text
            .trim()
            .parse()
            .map_err(|_| FsfsError::corrupt(format!("corrupt 'current' file: '{text}'")))?;
        *self.shared.youngest_cache.lock() = Some(rev);
        Ok(rev)
    }

    /// Atomically publish `rev` as the youngest revision.
    pub(crate) fn write_current(&self, rev: Rev) -> Result<()> {
        write_atomic(&self.layout.current(), format!("{rev}\n").as_bytes(), true)?;
        *self.shared.youngest_cache.lock() = Some(rev);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Committed read side
    // -----------------------------------------------------------------

    fn open_rev_file(&self, rev: Rev) -> Result<File> {
        match File::open(self.layout.rev_file(rev)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(FsfsError::NoSuchRevision { rev })
            }
            Err(e) => Err(FsfsError::Io(e)),
        }
    }

    /// `(root_offset, changed_paths_offset)` from the trailer of
    /// `revs/<rev>`.
    pub fn rev_trailer(&self, rev: Rev) -> Result<(u64, u64)> {
        let mut file = self.open_rev_file(rev)?;
        let len = file.metadata().map_err(FsfsError::Io)?.len();
        let tail_len = len.min(64);
        file.seek(SeekFrom::End(-(tail_len as i64)))
            .map_err(FsfsError::Io)?;
        let mut tail = Vec::with_capacity(tail_len as usize);
        std::io::Read::read_to_end(&mut file, &mut tail).map_err(FsfsError::Io)?;

        let corrupt = || FsfsError::corrupt(format!("malformed trailer in revision file {rev}"));
        let tail = std::str::from_utf8(&tail).map_err(|_| corrupt())?;
        let stripped = tail.strip_suffix('\n').ok_or_else(corrupt)?;
        let line = match stripped.rfind('\n') {
            Some(i) => &stripped[i + 1..],
            None if (len as usize) <= 64 => stripped,
            None => return Err(corrupt()),
        };
        let (root, cp) = line.split_once(' ').ok_or_else(corrupt)?;
        Ok((
            root.parse().map_err(|_| corrupt())?,
            cp.parse().map_err(|_| corrupt())?,
        ))
    }

    /// The id of the root directory node-rev of `rev`.
    pub fn rev_root_id(&self, rev: Rev) -> Result<NodeRevId> {
        let (root_offset, _) = self.rev_trailer(rev)?;
        let noderev = self.node_rev(&NodeRevId::committed("0", "0", rev, root_offset))?;
        Ok(noderev.id)
    }

    /// Load a node-revision by id, wherever it lives.
    pub fn node_rev(&self, id: &NodeRevId) -> Result<NodeRev> {
        match &id.origin {
            IdOrigin::Committed { rev, offset } => {
                let file = self.open_rev_file(*rev)?;
                let mut reader = BufReader::new(file);
                reader
                    .seek(SeekFrom::Start(*offset))
                    .map_err(FsfsError::Io)?;
                let mut block = String::new();
                loop {
                    let mut line = String::new();
                    let n = reader.read_line(&mut line).map_err(FsfsError::Io)?;
                    if n == 0 || line == "\n" {
                        break;
                    }
                    block.push_str(&line);
                }
                NodeRev::parse(&block)
            }
            IdOrigin::Txn(_) => {
                let path = self.layout.txn_node_rev(id);
                let text = match fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(FsfsError::corrupt(format!(
                            "dangling node-rev reference '{id}'"
                        )));
                    }
                    Err(e) => return Err(FsfsError::Io(e)),
                };
                NodeRev::parse(&text)
            }
        }
    }

    /// The folded changed-path map of a committed revision.
    pub fn paths_changed(&self, rev: Rev) -> Result<BTreeMap<String, Change>> {
        let (_, cp_offset) = self.rev_trailer(rev)?;
        let mut file = self.open_rev_file(rev)?;
        file.seek(SeekFrom::Start(cp_offset)).map_err(FsfsError::Io)?;
        let mut rest = String::new();
        std::io::Read::read_to_string(&mut file, &mut rest).map_err(FsfsError::Io)?;

        // Drop the trailer line.
        let block_len = rest
            .strip_suffix('\n')
            .and_then(|s| s.rfind('\n').map(|i| i + 1))
            .unwrap_or(0);
        let records = crate::changes::parse_records(&rest[..block_len])?;
        let mut map = BTreeMap::new();
        for change in records {
            map.insert(change.path.clone(), change);
        }
        Ok(map)
    }

    /// Revision properties of `rev`.
    pub fn revision_proplist(&self, rev: Rev) -> Result<BTreeMap<String, String>> {
        let text = match fs::read_to_string(self.layout.revprops_file(rev)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsfsError::NoSuchRevision { rev });
            }
            Err(e) => return Err(FsfsError::Io(e)),
        };
        hashfile::read(&text)
    }

    /// The node-revision at `path` in committed revision `rev`.
    pub fn node_rev_at_path(&self, rev: Rev, path: &str) -> Result<NodeRev> {
        let root_id = self.rev_root_id(rev)?;
        crate::tree::lookup_from(self, &root_id, path)
    }

    /// Full file contents at `path` in committed revision `rev`.
    pub fn file_contents(&self, rev: Rev, path: &str) -> Result<Vec<u8>> {
        let noderev = self.node_rev_at_path(rev, path)?;
        if noderev.kind != NodeKind::File {
            return Err(FsfsError::NotFile {
                path: path.to_owned(),
            });
        }
        match &noderev.data_rep {
            Some(rep) => crate::rep::rep_contents(self, rep),
            None => Ok(Vec::new()),
        }
    }

    /// Run `f` with the lazily opened rep-cache handle.
    pub(crate) fn with_rep_cache<R>(
        &self,
        f: impl FnOnce(&mut RepCache) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.rep_cache.lock();
        if guard.is_none() {
            *guard = Some(RepCache::open_or_create(&self.layout.rep_cache_db())?);
        }
        f(guard.as_mut().expect("rep cache opened above"))
    }

    /// Open the proto-rev file of a transaction for writing; see
    /// [`registry::get_writable_proto_rev`].
    pub(crate) fn writable_proto_rev(
        &self,
        txn_id: &fsvn_types::TxnId,
    ) -> Result<(File, registry::ProtoRevLockCookie)> {
        registry::get_writable_proto_rev(&self.shared, &self.layout, txn_id)
    }
}

/// RFC 3339 timestamp for `svn:date`.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse an `svn:date` value.
pub fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|_| FsfsError::BadDate {
            value: value.to_owned(),
        })
}

// Keep OpenOptions importable for sibling modules without re-importing in
// each; commit and transaction open append handles through this helper.
pub(crate) fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(FsfsError::Io)
}
