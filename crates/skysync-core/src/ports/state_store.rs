//! State store port: a transactional table of opaque rows keyed by id.
//!
//! One table exists per sync; the engine stages inserts and deletions in
//! memory and flushes them inside a transaction once per directory pass.

use thiserror::Error;

/// Failure of the underlying key/value table.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O failure: {0}")]
    Io(String),

    #[error("state store is not open")]
    Closed,
}

/// Port trait for the per-sync persistence table.
///
/// Row ids are assigned by the caller; the store only promises that
/// `put`/`del` inside `begin`..`commit` are atomic and that `rewind`/`next`
/// enumerate every row present at the last commit.
pub trait IStateStore: Send {
    /// Resets the bulk-load cursor to the first row.
    fn rewind(&mut self) -> Result<(), StoreError>;

    /// Returns the next `(id, payload)` row, or `None` at the end.
    fn next(&mut self) -> Result<Option<(u32, Vec<u8>)>, StoreError>;

    /// Inserts or replaces one row.
    fn put(&mut self, id: u32, data: &[u8]) -> Result<(), StoreError>;

    /// Deletes one row; deleting an absent row is not an error.
    fn del(&mut self, id: u32) -> Result<(), StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn abort(&mut self) -> Result<(), StoreError>;

    /// Removes every row. Used when a sync is torn down.
    fn truncate(&mut self) -> Result<(), StoreError>;
}
