//! Snapshot of one filesystem entry as produced by a directory scan.

use serde::{Deserialize, Serialize};

use super::fingerprint::FileFingerprint;
use super::newtypes::Fsid;

/// Kind of a synchronized entry.
///
/// `Unknown` means the entry could not be interrogated (open failed); such
/// rows are parked until a rescan resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Folder,
    Unknown,
}

impl NodeType {
    pub fn is_folder(self) -> bool {
        matches!(self, NodeType::Folder)
    }

    pub fn is_file(self) -> bool {
        matches!(self, NodeType::File)
    }
}

/// One directory entry as observed by a scan.
///
/// Ephemeral: lives in scan results and triplet rows, never persisted.
#[derive(Debug, Clone)]
pub struct FsNode {
    /// Entry name, a single path component.
    pub name: String,
    /// Legacy secondary name where the filesystem has one and it differs
    /// from `name`.
    pub short_name: Option<String>,
    pub node_type: NodeType,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Filesystem id, when the filesystem reported a usable one.
    pub fsid: Option<Fsid>,
    pub is_symlink: bool,
    /// Set when the entry could not be opened and the error was transient;
    /// the row is retried after a backoff instead of being treated as gone.
    pub is_blocked: bool,
    /// Content fingerprint, files only.
    pub fingerprint: Option<FileFingerprint>,
}

impl FsNode {
    /// A placeholder for an entry that could not be interrogated at all.
    pub fn unknown(name: String) -> Self {
        Self {
            name,
            short_name: None,
            node_type: NodeType::Unknown,
            size: 0,
            mtime: 0,
            fsid: None,
            is_symlink: false,
            is_blocked: false,
            fingerprint: None,
        }
    }

    /// Whether a previously-recorded entry still describes this one well
    /// enough that its fingerprint can be adopted without re-reading.
    pub fn can_reuse_fingerprint_of(&self, prior: &FsNode) -> bool {
        self.node_type == prior.node_type
            && self.fsid == prior.fsid
            && self.fsid.is_some()
            && self.mtime == prior.mtime
            && self.size == prior.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, fsid: u64, mtime: i64, size: u64) -> FsNode {
        FsNode {
            name: name.into(),
            short_name: None,
            node_type: NodeType::File,
            size,
            mtime,
            fsid: Some(Fsid(fsid)),
            is_symlink: false,
            is_blocked: false,
            fingerprint: None,
        }
    }

    #[test]
    fn test_fingerprint_reuse_requires_matching_identity() {
        let prior = file("a.txt", 7, 100, 10);
        assert!(file("a.txt", 7, 100, 10).can_reuse_fingerprint_of(&prior));
        assert!(!file("a.txt", 8, 100, 10).can_reuse_fingerprint_of(&prior));
        assert!(!file("a.txt", 7, 101, 10).can_reuse_fingerprint_of(&prior));
        assert!(!file("a.txt", 7, 100, 11).can_reuse_fingerprint_of(&prior));
    }

    #[test]
    fn test_fingerprint_reuse_rejects_undefined_fsid() {
        let mut prior = file("a.txt", 7, 100, 10);
        prior.fsid = None;
        let mut fresh = file("a.txt", 7, 100, 10);
        fresh.fsid = None;
        assert!(!fresh.can_reuse_fingerprint_of(&prior));
    }

    #[test]
    fn test_unknown_placeholder() {
        let n = FsNode::unknown("odd".into());
        assert_eq!(n.node_type, NodeType::Unknown);
        assert!(n.fsid.is_none());
        assert!(!n.is_blocked);
    }
}
