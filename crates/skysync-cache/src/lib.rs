//! Skysync Cache - SQLite-backed state persistence
//!
//! Implements the `IStateStore` port from `skysync-core` with one SQLite
//! database per sync, plus the per-process table of sync configurations.
//!
//! ## Key Components
//!
//! - [`SqliteStore`] - state table for one sync's reconciled nodes
//! - [`SyncConfigStore`] - configured syncs keyed by their stable tag
//! - [`state_store_name`] - derives a store name from root identity
//!
//! The engine owns its store from a single thread and drives explicit
//! transactions around each flush, so the synchronous SQLite binding is used
//! directly with no connection pooling.

pub mod configs;
pub mod store;

pub use configs::SyncConfigStore;
pub use store::{state_store_name, SqliteStore};

/// Errors from cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Opening or querying the database failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored payload could not be decoded.
    #[error("corrupt cache row: {0}")]
    CorruptRow(String),

    /// The database file location is unusable.
    #[error("cache directory unavailable: {0}")]
    BadLocation(String),
}
