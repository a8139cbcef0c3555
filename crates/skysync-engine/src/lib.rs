//! Skysync Engine - Bidirectional tree reconciliation
//!
//! Keeps a local filesystem subtree and a remote cloud subtree consistent.
//! Per pass, three views of every directory are aligned: the filesystem view
//! from a recent scan, the synced view persisted from the last
//! reconciliation, and the cloud view from the remote tree. Each aligned row
//! selects one of a small number of transitions (up/down sync, bind, delete,
//! conflict), with move/rename detection running first so a relocated entry
//! is never torn down and re-created.
//!
//! ## Components
//!
//! - [`scanner`] - off-thread directory scans with fingerprint reuse
//! - [`tree`] - the persistent reconciled tree and its secondary indexes
//! - [`triplet`] - alignment of the three views into rows
//! - [`engine`] - the recursive reconciler and its per-row transitions
//! - [`moves`] - move/rename detection in both directions
//! - [`statecache`] - staging and persistence of the tree across restarts
//! - [`watcher`] - filesystem notifications mapped to tree flags
//! - [`driver`] - the async run loop tying the pieces together

pub mod backoff;
pub mod debris;
pub mod driver;
pub mod engine;
pub mod fs_local;
pub mod moves;
pub mod scanner;
pub mod statecache;
pub mod tree;
pub mod triplet;
pub mod watcher;

pub use engine::{Sync, SyncEvent, SyncState};
pub use fs_local::LocalFileSystem;
pub use scanner::{ScanCookie, ScanRequest, ScanService};
pub use tree::{NodeId, SyncTree};
