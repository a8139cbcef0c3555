//! SQLite implementation of the per-sync state table.
//!
//! Each sync gets its own database file named after the identity triple
//! `(root fsid, root cloud handle, user id)`, so a sync re-created over the
//! same root resumes from its previous state while a different pairing
//! starts clean.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rusqlite::Connection;
use tracing::{debug, warn};

use skysync_core::domain::NodeHandle;
use skysync_core::ports::{IStateStore, StoreError};

use crate::CacheError;

/// Derives the state store name from the sync's identity triple.
///
/// The three values are packed little-endian and base64-encoded with the
/// URL-safe alphabet so the result is a valid file name on every platform.
pub fn state_store_name(root_fsid: u64, root_handle: NodeHandle, user_id: u64) -> String {
    let mut raw = [0u8; 24];
    raw[..8].copy_from_slice(&root_fsid.to_le_bytes());
    raw[8..16].copy_from_slice(&root_handle.0.to_le_bytes());
    raw[16..].copy_from_slice(&user_id.to_le_bytes());
    URL_SAFE_NO_PAD.encode(raw)
}

/// State table for one sync, stored as `<dir>/<name>.db`.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    /// Buffered rows for the rewind/next bulk-load cursor.
    cursor: Option<std::collections::VecDeque<(u32, Vec<u8>)>>,
    in_transaction: bool,
}

impl SqliteStore {
    /// Opens (creating if needed) the state store `name` under `dir`.
    pub fn open(dir: &Path, name: &str) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CacheError::BadLocation(format!("{}: {e}", dir.display())))?;
        let path = dir.join(format!("{name}.db"));
        let conn = Connection::open(&path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id      INTEGER PRIMARY KEY,
                content BLOB NOT NULL
            )",
            [],
        )?;

        debug!(path = %path.display(), "opened state store");
        Ok(Self {
            conn,
            path,
            cursor: None,
            in_transaction: false,
        })
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id      INTEGER PRIMARY KEY,
                content BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn,
            path: PathBuf::new(),
            cursor: None,
            in_transaction: false,
        })
    }

    /// Path of the backing database file (empty for in-memory stores).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_err(e: rusqlite::Error) -> StoreError {
        StoreError::Io(e.to_string())
    }
}

impl IStateStore for SqliteStore {
    fn rewind(&mut self) -> Result<(), StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, content FROM nodes ORDER BY id")
            .map_err(Self::store_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)))
            .map_err(Self::store_err)?
            .collect::<Result<std::collections::VecDeque<_>, _>>()
            .map_err(Self::store_err)?;
        debug!(rows = rows.len(), "state store rewind");
        self.cursor = Some(rows);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<(u32, Vec<u8>)>, StoreError> {
        match self.cursor.as_mut() {
            Some(rows) => Ok(rows.pop_front()),
            None => Err(StoreError::Io("next() before rewind()".into())),
        }
    }

    fn put(&mut self, id: u32, data: &[u8]) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO nodes (id, content) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET content = excluded.content",
                rusqlite::params![id as i64, data],
            )
            .map(|_| ())
            .map_err(Self::store_err)
    }

    fn del(&mut self, id: u32) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM nodes WHERE id = ?1", [id as i64])
            .map(|_| ())
            .map_err(Self::store_err)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if self.in_transaction {
            warn!("nested begin on state store, ignoring");
            return Ok(());
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(Self::store_err)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT").map_err(Self::store_err)?;
        self.in_transaction = false;
        Ok(())
    }

    fn abort(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(Self::store_err)?;
        self.in_transaction = false;
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM nodes", [])
            .map(|_| ())
            .map_err(Self::store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_name_is_stable_and_filename_safe() {
        let a = state_store_name(7, NodeHandle(9), 3);
        let b = state_store_name(7, NodeHandle(9), 3);
        assert_eq!(a, b);
        assert!(!a.contains('/') && !a.contains('+') && !a.contains('='));

        let c = state_store_name(8, NodeHandle(9), 3);
        assert_ne!(a, c);
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(1, b"one").unwrap();
        store.put(2, b"two").unwrap();
        store.put(1, b"one again").unwrap();

        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), Some((1, b"one again".to_vec())));
        assert_eq!(store.next().unwrap(), Some((2, b"two".to_vec())));
        assert_eq!(store.next().unwrap(), None);
    }

    #[test]
    fn test_del_removes_row() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(5, b"x").unwrap();
        store.del(5).unwrap();
        store.del(5).unwrap(); // absent is fine

        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), None);
    }

    #[test]
    fn test_abort_discards_writes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(1, b"kept").unwrap();

        store.begin().unwrap();
        store.put(2, b"discarded").unwrap();
        store.del(1).unwrap();
        store.abort().unwrap();

        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), Some((1, b"kept".to_vec())));
        assert_eq!(store.next().unwrap(), None);
    }

    #[test]
    fn test_commit_keeps_writes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.begin().unwrap();
        store.put(1, b"a").unwrap();
        store.commit().unwrap();

        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), Some((1, b"a".to_vec())));
    }

    #[test]
    fn test_truncate_empties_table() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.put(1, b"a").unwrap();
        store.put(2, b"b").unwrap();
        store.truncate().unwrap();

        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), None);
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let name = state_store_name(1, NodeHandle(2), 3);
        {
            let mut store = SqliteStore::open(dir.path(), &name).unwrap();
            store.put(9, b"persisted").unwrap();
        }
        let mut store = SqliteStore::open(dir.path(), &name).unwrap();
        store.rewind().unwrap();
        assert_eq!(store.next().unwrap(), Some((9, b"persisted".to_vec())));
    }
}
