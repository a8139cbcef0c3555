//! Local filesystem port (driven/secondary port).
//!
//! The engine performs only short, bounded filesystem calls inline (open,
//! stat, rename, mkdir); directory enumeration and fingerprinting run on the
//! scan worker pool, which consumes the same trait from its own threads.
//!
//! ## Design Notes
//!
//! - Errors carry a transient/permanent classification. Transient failures
//!   (file busy, interrupted) park the row behind a backoff timer; permanent
//!   ones block it until a parent rescan.
//! - Entry names are UTF-8 `String`s. Filesystems whose names do not decode
//!   cleanly are the adapter's problem to transliterate or skip.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::domain::{FileFingerprint, Fsid, NodeType};

/// Filesystem failure, classified for retry behaviour.
#[derive(Debug, Error)]
pub enum FsError {
    /// The operation may succeed if retried shortly (file locked by another
    /// process, interrupted call, resources exhausted).
    #[error("transient filesystem error: {0}")]
    Transient(#[source] io::Error),

    /// The operation will keep failing until something else changes.
    #[error("filesystem error: {0}")]
    Permanent(#[source] io::Error),
}

impl FsError {
    /// Classifies a raw I/O error.
    pub fn from_io(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            Interrupted | WouldBlock | TimedOut | ResourceBusy => FsError::Transient(err),
            _ => FsError::Permanent(err),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient(_))
    }
}

/// Stat result for one open handle.
#[derive(Debug, Clone)]
pub struct Stat {
    pub node_type: NodeType,
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Filesystem id, `None` when the filesystem cannot supply a stable one.
    pub fsid: Option<Fsid>,
    pub is_symlink: bool,
}

/// An open filesystem entry.
pub trait FileHandle {
    fn stat(&self) -> &Stat;

    /// Computes the content fingerprint by reading the file through this
    /// handle. Folders return a permanent error.
    fn fingerprint(&mut self) -> Result<FileFingerprint, FsError>;
}

/// Name comparison rules of the volume holding the sync root.
///
/// Local child maps are always case-sensitive, but matching cloud names to
/// local ones must honour the target filesystem, or a case-renamed file
/// would churn through delete/create cycles forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameCase {
    Sensitive,
    Insensitive,
}

impl NameCase {
    /// Compares two names under these rules.
    pub fn cmp_names(self, a: &str, b: &str) -> std::cmp::Ordering {
        match self {
            NameCase::Sensitive => a.cmp(b),
            NameCase::Insensitive => a.to_lowercase().cmp(&b.to_lowercase()),
        }
    }

    pub fn names_equal(self, a: &str, b: &str) -> bool {
        self.cmp_names(a, b).is_eq()
    }
}

/// Port trait for local filesystem operations.
///
/// Implementations must be callable from both the reconciler thread and the
/// scan worker threads.
pub trait IFileSystem: Send + Sync {
    /// Opens an entry for stat/fingerprint access.
    ///
    /// With `follow_symlinks` false, a symlink opens as the link itself and
    /// `stat().is_symlink` is set.
    fn open(&self, path: &Path, follow_symlinks: bool) -> Result<Box<dyn FileHandle>, FsError>;

    /// Lists the child names of a directory.
    fn enumerate(&self, path: &Path) -> Result<Vec<String>, FsError>;

    /// Atomically renames `from` to `to` (same volume).
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Creates a directory; with `recursive`, creates missing parents too.
    /// Succeeds if the directory already exists only when `recursive`.
    fn mkdir(&self, path: &Path, recursive: bool) -> Result<(), FsError>;

    /// Legacy secondary name of the entry, where the filesystem keeps one
    /// distinct from the long name. `None` on filesystems without them.
    fn short_name(&self, path: &Path) -> Option<String>;

    /// Identity of the volume holding `path`, used to detect the sync root
    /// moving to a different filesystem between runs.
    fn volume_fingerprint(&self, path: &Path) -> Option<u64>;

    /// Whether filesystem ids survive unmount/remount. When they do not,
    /// persisted fsids are discarded on load.
    fn fsids_stable(&self) -> bool;

    /// Name comparison rules for the volume holding `root`.
    fn name_case(&self, root: &Path) -> NameCase;
}
