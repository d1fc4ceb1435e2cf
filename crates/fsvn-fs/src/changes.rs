//! The changed-paths journal and its fold operation.
//!
//! Every mutation appends one [`Change`] record to the transaction's
//! `changes` file. Folding reduces that ordered journal to a canonical
//! `path → change` map: later records merge into earlier ones, deletions
//! of in-transaction adds annihilate, and a `delete` or `replace` removes
//! every entry for a proper descendant of the folded path.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write as _;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{Change, ChangeKind, Cx, TxnId};

use crate::layout::Layout;

/// How often the fold loop checkpoints for cancellation.
const CANCEL_INTERVAL: usize = 1024;

/// Append one record to the transaction's journal.
pub(crate) fn add_change(layout: &Layout, txn_id: &TxnId, change: &Change) -> Result<()> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(layout.txn_changes(txn_id))
        .map_err(FsfsError::Io)?;
    file.write_all(change.to_string().as_bytes())
        .map_err(FsfsError::Io)?;
    Ok(())
}

/// Parse a sequence of two-line change records.
pub(crate) fn parse_records(text: &str) -> Result<Vec<Change>> {
    let mut changes = Vec::new();
    let mut lines = text.split('\n');
    loop {
        let Some(change_line) = lines.next() else {
            break;
        };
        if change_line.is_empty() {
            // Trailing newline of the final record.
            break;
        }
        let copyfrom_line = lines.next().ok_or_else(|| {
            FsfsError::corrupt("changes journal truncated inside a record")
        })?;
        changes.push(Change::parse(change_line, copyfrom_line)?);
    }
    Ok(changes)
}

/// Serialize a folded change map as the changed-paths block of a revision
/// file. Entries are written in path order for determinism.
pub(crate) fn unparse_records(changes: &BTreeMap<String, Change>) -> String {
    let mut out = String::new();
    for change in changes.values() {
        out.push_str(&change.to_string());
    }
    out
}

/// Separator-aware ancestry test: is `child` a proper child of `parent`?
pub(crate) fn is_child(parent: &str, child: &str) -> bool {
    if parent == "/" {
        return child.len() > 1 && child.starts_with('/');
    }
    child.len() > parent.len() + 1
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Merge one journal record into the folded map.
fn fold_change(folded: &mut BTreeMap<String, Change>, change: &Change) -> Result<()> {
    let Some(old) = folded.get_mut(&change.path) else {
        folded.insert(change.path.clone(), change.clone());
        return Ok(());
    };

    // Only a reset may omit the node revision ID.
    if change.noderev_id.is_none() && change.kind != ChangeKind::Reset {
        return Err(FsfsError::corrupt("missing required node revision ID"));
    }

    // We should be talking about the same node revision ID as the prior
    // change, except when the prior change was a deletion.
    if let Some(new_id) = &change.noderev_id {
        if old.noderev_id.as_ref() != Some(new_id) && old.kind != ChangeKind::Delete {
            return Err(FsfsError::change_ordering(
                "new node revision ID without delete",
            ));
        }
    }

    // An add, replace, or reset must be the first thing to follow a
    // deletion.
    if old.kind == ChangeKind::Delete
        && !matches!(
            change.kind,
            ChangeKind::Add | ChangeKind::Replace | ChangeKind::Reset
        )
    {
        return Err(FsfsError::change_ordering(
            "non-add change on deleted path",
        ));
    }

    // An add can't follow anything except a delete or reset.
    if change.kind == ChangeKind::Add
        && old.kind != ChangeKind::Delete
        && old.kind != ChangeKind::Reset
    {
        return Err(FsfsError::change_ordering(
            "add change on preexisting path",
        ));
    }

    match change.kind {
        ChangeKind::Reset => {
            folded.remove(&change.path);
        }
        ChangeKind::Delete => {
            if old.kind == ChangeKind::Add {
                // Introduced in this transaction and deleted again: the
                // path never happened.
                folded.remove(&change.path);
            } else {
                old.kind = ChangeKind::Delete;
                old.text_mod = change.text_mod;
                old.prop_mod = change.prop_mod;
                old.node_kind = change.node_kind;
                old.copyfrom = None;
            }
        }
        ChangeKind::Add | ChangeKind::Replace => {
            // An add here follows a previous delete; treat both as replace.
            old.kind = ChangeKind::Replace;
            old.noderev_id = change.noderev_id.clone();
            old.node_kind = change.node_kind;
            old.text_mod = change.text_mod;
            old.prop_mod = change.prop_mod;
            old.copyfrom = change.copyfrom.clone();
        }
        ChangeKind::Modify => {
            old.text_mod |= change.text_mod;
            old.prop_mod |= change.prop_mod;
        }
    }

    Ok(())
}

/// Fold an ordered journal into the canonical per-path map.
pub fn fold(cx: &Cx, changes: &[Change]) -> Result<BTreeMap<String, Change>> {
    let mut folded: BTreeMap<String, Change> = BTreeMap::new();

    for (i, change) in changes.iter().enumerate() {
        if i % CANCEL_INTERVAL == 0 {
            cx.checkpoint()?;
        }
        fold_change(&mut folded, change)?;

        // A deletion or replacement blows away any changes recorded so far
        // for children of the folded path. The map is ordered, so all
        // children sit in one contiguous key range.
        if matches!(change.kind, ChangeKind::Delete | ChangeKind::Replace) {
            let prefix = if change.path == "/" {
                "/".to_owned()
            } else {
                format!("{}/", change.path)
            };
            let doomed: Vec<String> = folded
                .range(prefix.clone()..)
                .take_while(|(path, _)| path.starts_with(&prefix))
                .map(|(path, _)| path.clone())
                .collect();
            for path in doomed {
                folded.remove(&path);
            }
        }
    }

    Ok(folded)
}

/// Read and fold the journal of `txn_id`.
pub(crate) fn fetch(cx: &Cx, layout: &Layout, txn_id: &TxnId) -> Result<BTreeMap<String, Change>> {
    let text = std::fs::read_to_string(layout.txn_changes(txn_id)).map_err(FsfsError::Io)?;
    let records = parse_records(&text)?;
    fold(cx, &records)
}
