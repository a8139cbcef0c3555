//! Per-process table of configured syncs.
//!
//! Each configuration is keyed by its stable integer tag and stored as a
//! JSON payload, so adding fields to `SyncConfig` stays backward compatible
//! with existing rows.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, warn};

use skysync_core::config::SyncConfig;

use crate::CacheError;

/// Persistent set of sync configurations.
pub struct SyncConfigStore {
    conn: Connection,
}

impl SyncConfigStore {
    /// Opens (creating if needed) the configuration table at `path`.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::BadLocation(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS syncconfigs (
                tag     INTEGER PRIMARY KEY,
                content TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS syncconfigs (
                tag     INTEGER PRIMARY KEY,
                content TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Inserts or updates one configuration, keyed by its tag.
    pub fn insert(&mut self, config: &SyncConfig) -> Result<(), CacheError> {
        let payload = serde_json::to_string(config)
            .map_err(|e| CacheError::CorruptRow(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO syncconfigs (tag, content) VALUES (?1, ?2)
             ON CONFLICT(tag) DO UPDATE SET content = excluded.content",
            rusqlite::params![config.tag as i64, payload],
        )?;
        debug!(tag = config.tag, "stored sync configuration");
        Ok(())
    }

    /// Removes the configuration with the given tag. Returns whether a row
    /// was deleted.
    pub fn remove(&mut self, tag: u32) -> Result<bool, CacheError> {
        let n = self
            .conn
            .execute("DELETE FROM syncconfigs WHERE tag = ?1", [tag as i64])?;
        Ok(n > 0)
    }

    /// Looks up one configuration by tag.
    pub fn get(&self, tag: u32) -> Result<Option<SyncConfig>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT content FROM syncconfigs WHERE tag = ?1")?;
        let mut rows = stmt.query([tag as i64])?;
        match rows.next()? {
            Some(row) => {
                let payload: String = row.get(0)?;
                let config = serde_json::from_str(&payload)
                    .map_err(|e| CacheError::CorruptRow(e.to_string()))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// Returns every stored configuration, ordered by tag. Rows that fail
    /// to decode are skipped with a warning rather than failing the load.
    pub fn all(&self) -> Result<Vec<SyncConfig>, CacheError> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag, content FROM syncconfigs ORDER BY tag")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut configs = BTreeMap::new();
        for row in rows {
            let (tag, payload) = row?;
            match serde_json::from_str::<SyncConfig>(&payload) {
                Ok(config) => {
                    configs.insert(tag, config);
                }
                Err(err) => {
                    warn!(tag, error = %err, "skipping undecodable sync configuration");
                }
            }
        }
        Ok(configs.into_values().collect())
    }

    /// Removes every configuration.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.conn.execute("DELETE FROM syncconfigs", [])?;
        Ok(())
    }
}
