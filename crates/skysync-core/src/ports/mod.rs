//! Port traits consumed by the reconciliation engine.
//!
//! Adapters implement these: the local filesystem and watcher live in
//! `skysync-engine`, the SQLite state store in `skysync-cache`, and the real
//! cloud drive in the application embedding the engine.

pub mod cloud;
pub mod filesystem;
pub mod state_store;

pub use cloud::{CloudError, ICloudDrive};
pub use filesystem::{FileHandle, FsError, IFileSystem, NameCase, Stat};
pub use state_store::{IStateStore, StoreError};
