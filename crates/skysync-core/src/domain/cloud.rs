//! Snapshot of one remote node as seen through the cloud drive port.

use super::fingerprint::FileFingerprint;
use super::fsnode::NodeType;
use super::newtypes::NodeHandle;

/// View of a remote node at the time the reconciler asked for it.
///
/// The cloud drive owns the authoritative remote tree and refreshes it from
/// acknowledgement packets; the reconciler only ever works on snapshots.
#[derive(Debug, Clone)]
pub struct CloudNode {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    /// Display name as stored remotely.
    pub name: String,
    pub node_type: NodeType,
    /// Content fingerprint, files only.
    pub fingerprint: Option<FileFingerprint>,
    /// True while mutating commands for this node are still in flight.
    /// Rows under such a node are skipped until the commands drain.
    pub has_pending_changes: bool,
}

impl CloudNode {
    pub fn folder(handle: NodeHandle, parent: Option<NodeHandle>, name: impl Into<String>) -> Self {
        Self {
            handle,
            parent,
            name: name.into(),
            node_type: NodeType::Folder,
            fingerprint: None,
            has_pending_changes: false,
        }
    }

    pub fn file(
        handle: NodeHandle,
        parent: Option<NodeHandle>,
        name: impl Into<String>,
        fingerprint: FileFingerprint,
    ) -> Self {
        Self {
            handle,
            parent,
            name: name.into(),
            node_type: NodeType::File,
            fingerprint: Some(fingerprint),
            has_pending_changes: false,
        }
    }
}
