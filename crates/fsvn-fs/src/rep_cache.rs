//! The sqlite-backed rep-sharing index (`rep-cache.db`).
//!
//! Maps a SHA-1 digest to the committed representation carrying that
//! content. Rows are only ever added (at commit time, in one sqlite
//! transaction); collisions with concurrently inserted rows are ignored,
//! because an existing row for the same hash necessarily points at
//! equivalent content.
//!
//! Consistency policy is the caller's job: a row pointing past the
//! youngest revision is treated as hard corruption there, while other
//! lookup failures degrade to "no match" with a warning.

use std::path::Path;

use fsvn_error::{FsfsError, Result};
use fsvn_types::{RepOrigin, Representation};

fn sql_err(e: rusqlite::Error) -> FsfsError {
    FsfsError::rep_cache(e.to_string())
}

/// An open handle on `rep-cache.db`.
#[derive(Debug)]
pub(crate) struct RepCache {
    conn: rusqlite::Connection,
}

impl RepCache {
    /// Open the database, creating it and its schema if absent.
    pub(crate) fn open_or_create(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rep_cache (
                 hash TEXT NOT NULL PRIMARY KEY,
                 revision INTEGER NOT NULL,
                 offset INTEGER NOT NULL,
                 size INTEGER NOT NULL,
                 expanded_size INTEGER NOT NULL
             )",
        )
        .map_err(sql_err)?;
        Ok(Self { conn })
    }

    /// Look up the representation recorded for `sha1`.
    ///
    /// The returned rep carries a zeroed MD5 and no uniquifier; the caller
    /// overwrites both from the rep it just wrote.
    pub(crate) fn get_rep_reference(&self, sha1: &[u8; 20]) -> Result<Option<Representation>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT revision, offset, size, expanded_size
                 FROM rep_cache WHERE hash = ?1",
            )
            .map_err(sql_err)?;
        let mut rows = stmt.query([hex::encode(sha1)]).map_err(sql_err)?;
        let Some(row) = rows.next().map_err(sql_err)? else {
            return Ok(None);
        };
        let get_u64 = |idx: usize| -> Result<u64> {
            let v: i64 = row.get(idx).map_err(sql_err)?;
            u64::try_from(v)
                .map_err(|_| FsfsError::rep_cache(format!("negative value in rep_cache row: {v}")))
        };
        Ok(Some(Representation {
            origin: RepOrigin::Committed(get_u64(0)?),
            offset: get_u64(1)?,
            size: get_u64(2)?,
            expanded_size: get_u64(3)?,
            md5: [0; 16],
            sha1: Some(*sha1),
            uniquifier: None,
        }))
    }

    /// Record `rep` under `sha1`. An existing row for the same hash wins.
    pub(crate) fn set_rep_reference(&self, rep: &Representation) -> Result<()> {
        let RepOrigin::Committed(revision) = rep.origin else {
            return Err(FsfsError::rep_cache(
                "refusing to cache a mutable representation".to_owned(),
            ));
        };
        let Some(sha1) = rep.sha1 else {
            return Err(FsfsError::rep_cache(
                "refusing to cache a representation without SHA-1".to_owned(),
            ));
        };
        let to_i64 = |v: u64, what: &str| -> Result<i64> {
            i64::try_from(v).map_err(|_| FsfsError::rep_cache(format!("{what} overflows sqlite")))
        };
        self.conn
            .execute(
                "INSERT OR IGNORE INTO rep_cache
                     (hash, revision, offset, size, expanded_size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    hex::encode(sha1),
                    to_i64(revision, "revision")?,
                    to_i64(rep.offset, "offset")?,
                    to_i64(rep.size, "size")?,
                    to_i64(rep.expanded_size, "expanded size")?,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    /// Insert a batch of rows inside a single sqlite transaction.
    pub(crate) fn set_rep_references<'a>(
        &mut self,
        reps: impl IntoIterator<Item = &'a Representation>,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(sql_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO rep_cache
                         (hash, revision, offset, size, expanded_size)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(sql_err)?;
            for rep in reps {
                let RepOrigin::Committed(revision) = rep.origin else {
                    return Err(FsfsError::rep_cache(
                        "refusing to cache a mutable representation".to_owned(),
                    ));
                };
                let Some(sha1) = rep.sha1 else {
                    continue;
                };
                let to_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
                stmt.execute(rusqlite::params![
                    hex::encode(sha1),
                    to_i64(revision),
                    to_i64(rep.offset),
                    to_i64(rep.size),
                    to_i64(rep.expanded_size),
                ])
                .map_err(sql_err)?;
            }
        }
        tx.commit().map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed_rep(rev: u64, offset: u64, sha1_byte: u8) -> Representation {
        Representation {
            origin: RepOrigin::Committed(rev),
            offset,
            size: 10,
            expanded_size: 20,
            md5: [7; 16],
            sha1: Some([sha1_byte; 20]),
            uniquifier: Some("1-1/_2".to_owned()),
        }
    }

    #[test]
    fn insert_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepCache::open_or_create(&dir.path().join("rep-cache.db")).unwrap();

        assert!(cache.get_rep_reference(&[1; 20]).unwrap().is_none());

        let rep = committed_rep(3, 1024, 1);
        cache.set_rep_reference(&rep).unwrap();
        let found = cache.get_rep_reference(&[1; 20]).unwrap().unwrap();
        assert_eq!(found.origin, RepOrigin::Committed(3));
        assert_eq!(found.offset, 1024);
        assert_eq!(found.size, 10);
        assert_eq!(found.expanded_size, 20);
        // md5/uniquifier are not stored
        assert_eq!(found.md5, [0; 16]);
        assert!(found.uniquifier.is_none());
    }

    #[test]
    fn collisions_keep_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepCache::open_or_create(&dir.path().join("rep-cache.db")).unwrap();

        cache.set_rep_reference(&committed_rep(1, 100, 9)).unwrap();
        cache.set_rep_reference(&committed_rep(2, 999, 9)).unwrap();

        let found = cache.get_rep_reference(&[9; 20]).unwrap().unwrap();
        assert_eq!(found.origin, RepOrigin::Committed(1));
        assert_eq!(found.offset, 100);
    }

    #[test]
    fn batch_insert_is_transactional() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RepCache::open_or_create(&dir.path().join("rep-cache.db")).unwrap();

        let reps = vec![
            committed_rep(1, 0, 1),
            committed_rep(1, 50, 2),
            committed_rep(1, 100, 3),
        ];
        cache.set_rep_references(reps.iter()).unwrap();
        for b in 1u8..=3 {
            assert!(cache.get_rep_reference(&[b; 20]).unwrap().is_some());
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rep-cache.db");
        {
            let cache = RepCache::open_or_create(&path).unwrap();
            cache.set_rep_reference(&committed_rep(5, 77, 4)).unwrap();
        }
        let cache = RepCache::open_or_create(&path).unwrap();
        let found = cache.get_rep_reference(&[4; 20]).unwrap().unwrap();
        assert_eq!(found.origin, RepOrigin::Committed(5));
    }

    #[test]
    fn rejects_mutable_rep() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepCache::open_or_create(&dir.path().join("rep-cache.db")).unwrap();
        let mut rep = committed_rep(1, 0, 8);
        rep.origin = RepOrigin::Txn("1-1".parse().unwrap());
        assert!(cache.set_rep_reference(&rep).is_err());
    }
}
