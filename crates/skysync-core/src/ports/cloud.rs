//! Cloud drive port (driven/secondary port).
//!
//! The engine treats the remote side as a tree it can query plus a command
//! channel it can push mutations into. Mutations are fire-and-forget: each
//! returns a [`PendingChange`] tag immediately, the adapter applies it
//! asynchronously, and the remote tree snapshot reflects the result once the
//! acknowledgement arrives. While a node has unacknowledged commands its
//! snapshot reports `has_pending_changes`, which holds further work back.
//!
//! Byte transfers are similarly delegated: `start_upload`/`start_download`
//! hand the work to the transfer subsystem and return a ticket.

use std::path::Path;

use thiserror::Error;

use crate::domain::{CloudNode, FileFingerprint, NodeHandle, PendingChange, TransferId};

/// Failure of a cloud command at submission time.
///
/// Most failures surface later through the remote tree instead; only errors
/// the adapter can detect synchronously are reported here.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The operation is not permitted for this account or share.
    #[error("cloud operation not permitted")]
    PermissionDenied,

    /// The target node is no longer known to the remote tree.
    #[error("cloud node {0} unknown")]
    UnknownNode(NodeHandle),

    /// The drive cannot accept commands right now.
    #[error("cloud drive unavailable: {0}")]
    Unavailable(String),
}

/// Port trait for the remote side of a sync.
pub trait ICloudDrive: Send {
    // ------------------------------------------------------------------
    // Remote tree queries
    // ------------------------------------------------------------------

    /// Snapshot of one node, if it exists remotely.
    fn node(&self, handle: NodeHandle) -> Option<CloudNode>;

    /// Snapshots of a folder's children.
    fn children(&self, parent: NodeHandle) -> Vec<CloudNode>;

    // ------------------------------------------------------------------
    // Mutations (fire-and-forget, acknowledged through the remote tree)
    // ------------------------------------------------------------------

    /// Renames a node in place.
    fn rename_node(
        &mut self,
        node: NodeHandle,
        new_name: &str,
    ) -> Result<PendingChange, CloudError>;

    /// Moves a node under a new parent, optionally renaming it in the same
    /// command.
    fn move_node(
        &mut self,
        node: NodeHandle,
        new_parent: NodeHandle,
        new_name: Option<&str>,
    ) -> Result<PendingChange, CloudError>;

    /// Creates an empty remote folder.
    fn put_folder(
        &mut self,
        parent: NodeHandle,
        name: &str,
    ) -> Result<PendingChange, CloudError>;

    /// Moves a node into the remote debris folder instead of deleting it
    /// outright.
    fn move_to_sync_debris(&mut self, node: NodeHandle) -> Result<PendingChange, CloudError>;

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Starts uploading a local file; the node appears under `parent` with
    /// `name` once the transfer and its acknowledgement complete.
    fn start_upload(
        &mut self,
        parent: NodeHandle,
        name: &str,
        local_path: &Path,
        fingerprint: FileFingerprint,
    ) -> Result<TransferId, CloudError>;

    /// Starts downloading a remote file to `local_path`.
    fn start_download(
        &mut self,
        node: NodeHandle,
        local_path: &Path,
    ) -> Result<TransferId, CloudError>;

    /// Cancels all transfers targeting `node` or anything below it. Used
    /// when a subtree is destroyed or the sync is cancelled.
    fn cancel_transfers_below(&mut self, node: NodeHandle);
}
