//! Move and rename detection.
//!
//! When an entry disappears on one side and reappears elsewhere, the
//! reconciler must replay the move rather than tear the entry down and
//! recreate it. Detection runs in both directions:
//!
//! - **Local**: a scanned entry whose fsid belongs to a different
//!   reconciled node is the destination of a local move; the corresponding
//!   cloud node is renamed or moved to match.
//! - **Cloud**: a cloud node whose handle is synced to a reconciled node at
//!   another path was moved remotely; the local entry is renamed to match.
//!
//! Two guards protect the fsid match: inode reuse is rejected by requiring
//! matching mtime and size for files, and a file that is still being
//! written (editors often move the original aside first) defers the move
//! until its size and mtime settle, with a hard ceiling.
//!
//! Each method returns `Some(row_result)` when it consumed the row and
//! `None` when the normal transition table should proceed.

use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use skysync_core::domain::{FsNode, NodeType};
use skysync_core::ports::CloudError;

use crate::engine::{Sync, SyncEvent};
use crate::tree::NodeId;
use crate::triplet::SyncRow;

/// Observation history for one possibly-still-changing file.
#[derive(Debug, Clone)]
pub struct FileChangingState {
    first_seen: Instant,
    last_check: Option<Instant>,
    last_size: u64,
}

impl Sync {
    /// Local-direction detection: is this row the destination of a local
    /// move or rename?
    pub(crate) fn check_local_moves_renames(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        parent_cloud: Option<&skysync_core::domain::CloudNode>,
        full_path: &Path,
    ) -> Option<bool> {
        let fsn = row.fs.clone().expect("filesystem view present");

        if fsn.is_symlink {
            debug!(path = %full_path.display(), "path is a symlink, blocked");
            if let Some(sref) = &row.sync {
                self.tree.set_use_blocked(sref.id);
            }
            return Some(false);
        }

        if let Some(sref) = &row.sync {
            let type_mismatch = self
                .tree
                .node(sref.id)
                .is_some_and(|n| n.node_type != fsn.node_type && n.node_type != NodeType::Unknown);
            if type_mismatch {
                debug!(path = %full_path.display(), "entry changed type, blocked");
                self.tree.set_use_blocked(sref.id);
                return Some(false);
            }
        }

        let source = self.find_move_source_by_fsid(row, full_path)?;
        let source_path = self.tree.path_of(source);

        // An editor may be rewriting the file through a temporary move;
        // wait until it settles.
        let is_file = fsn.node_type.is_file();
        if is_file && self.check_if_file_is_changing(&fsn, &source_path) {
            return Some(false);
        }

        debug!(
            new_path = %full_path.display(),
            old_path = %source_path.display(),
            "move detected by fsid"
        );

        let source_handle = self.tree.node(source).and_then(|n| n.synced_handle);
        let source_cloud = source_handle.and_then(|h| self.cloud.node(h));
        let target_cloud = self
            .tree
            .node(parent)
            .and_then(|n| n.synced_handle)
            .and_then(|h| self.cloud.node(h))
            .or_else(|| parent_cloud.cloned());

        let (Some(source_cloud), Some(target_cloud)) = (source_cloud, target_cloud) else {
            debug!(path = %full_path.display(), "move source or target unavailable in the cloud");
            return None;
        };

        if source_cloud.has_pending_changes {
            // Come back once the in-flight command drains.
            debug!(path = %full_path.display(), "commands already in progress for the move source");
            self.flags.actioned_moves_renames = true;
            return Some(false);
        }

        let new_name = (fsn.name != source_cloud.name).then(|| fsn.name.clone());

        if source_cloud.parent == Some(target_cloud.handle) && new_name.is_none() {
            debug!(path = %full_path.display(), "move/rename has completed");
            return None;
        }

        // The destination already held a different cloud node: it is being
        // replaced, so quarantine it first.
        if let Some(existing) = &row.cloud {
            if existing.handle != source_cloud.handle {
                debug!(path = %full_path.display(), "moving replaced node to sync debris");
                if let Err(err) = self.cloud.move_to_sync_debris(existing.handle) {
                    warn!(path = %full_path.display(), error = %err, "debris move failed");
                }
            }
        }

        let command = if source_cloud.parent == Some(target_cloud.handle) {
            debug!(
                from = %source_cloud.name,
                to = %fsn.name,
                "renaming cloud node"
            );
            self.cloud
                .rename_node(source_cloud.handle, new_name.as_deref().expect("rename has a name"))
        } else {
            debug!(
                node = %source_cloud.handle,
                new_parent = %target_cloud.handle,
                "moving cloud node"
            );
            self.cloud
                .move_node(source_cloud.handle, target_cloud.handle, new_name.as_deref())
        };

        match command {
            Ok(_) => {
                // Command sent; once its acknowledgement lands the row
                // reads as synced from the two live sides and the
                // reconciled view is rebuilt from them.
                self.flags.actioned_moves_renames = true;
                self.emit(SyncEvent::MoveDetected {
                    from: source_path,
                    to: full_path.to_path_buf(),
                });
                Some(false)
            }
            Err(CloudError::PermissionDenied) => {
                debug!(path = %full_path.display(), "move/rename not permitted");
                None
            }
            Err(err) => {
                warn!(path = %full_path.display(), error = %err, "move/rename failed to start");
                Some(false)
            }
        }
    }

    /// Finds the reconciled node currently owning the row's fsid, applying
    /// the inode-reuse guards. Clears the row's fsid (and returns `None`)
    /// when the match must be rejected.
    fn find_move_source_by_fsid(&mut self, row: &mut SyncRow, full_path: &Path) -> Option<NodeId> {
        let (fsid, node_type, mtime, size) = {
            let fsn = row.fs.as_ref().expect("filesystem view present");
            (fsn.fsid?, fsn.node_type, fsn.mtime, fsn.size)
        };
        let row_node = row.sync.as_ref().map(|s| s.id);

        let candidate = self
            .tree
            .nodes_by_fsid(fsid)
            .iter()
            .copied()
            .find(|&id| {
                if Some(id) == row_node {
                    return false;
                }
                self.tree
                    .node(id)
                    .is_some_and(|n| n.node_type == node_type)
            })?;

        // An fsid match with different content is inode reuse, not a move.
        if node_type.is_file() {
            let matches = self.tree.node(candidate).is_some_and(|n| {
                n.fingerprint
                    .is_some_and(|f| f.mtime == mtime && f.size == size)
            });
            if !matches {
                debug!(path = %full_path.display(), "detaching reused fsid");
                if let Some(fsn) = row.fs.as_mut() {
                    fsn.fsid = None;
                }
                return None;
            }
        }

        Some(candidate)
    }

    /// Cloud-direction detection: was this row's cloud node moved or
    /// renamed remotely?
    pub(crate) fn check_cloud_moves_renames(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        full_path: &Path,
    ) -> Option<bool> {
        let cn = row.cloud.as_ref().expect("cloud view present");

        if let Some(sref) = &row.sync {
            let type_mismatch = self
                .tree
                .node(sref.id)
                .is_some_and(|n| n.node_type != cn.node_type && n.node_type != NodeType::Unknown);
            if type_mismatch {
                debug!(path = %full_path.display(), "cloud node changed type, blocked");
                self.tree.set_use_blocked(sref.id);
                return Some(false);
            }
        }

        // The previous location must still exist on disk for a rename to
        // replay the move.
        let row_node = row.sync.as_ref().map(|s| s.id);
        let source = self
            .tree
            .nodes_by_handle(cn.handle)
            .iter()
            .copied()
            .filter(|id| Some(*id) != row_node)
            .find(|id| {
                let path = self.tree.path_of(*id);
                self.fs.open(&path, false).is_ok()
            })?;

        let source_path = self.tree.path_of(source);
        debug!(
            from = %source_path.display(),
            to = %full_path.display(),
            "renaming local entry after remote move"
        );

        match self.fs.rename(&source_path, full_path) {
            Ok(()) => {
                self.flags.actioned_moves_renames = true;
                self.emit(SyncEvent::MoveDetected {
                    from: source_path.clone(),
                    to: full_path.to_path_buf(),
                });

                // Both folders are rebuilt by fresh scans; the reconciled
                // nodes are recreated at the new location and removed at
                // the old one.
                if let Some(source_parent) = self.tree.node(source).and_then(|n| n.parent) {
                    self.tree.set_future_scan(source_parent, true, false);
                }
                self.tree.set_future_scan(parent, true, true);
                Some(false)
            }
            Err(err) if err.is_transient() => {
                warn!(path = %full_path.display(), error = %err, "local rename blocked");
                if let Some(sref) = &row.sync {
                    self.tree.set_use_blocked(sref.id);
                }
                Some(false)
            }
            Err(err) => {
                warn!(path = %full_path.display(), error = %err, "local rename failed");
                None
            }
        }
    }

    /// Heuristic guard against moving a file that is still being written.
    ///
    /// Defers while the file at the old location keeps changing size or
    /// carries a very fresh mtime; gives up deferring after a hard
    /// ceiling so a steadily-growing file (a log, say) still syncs.
    pub(crate) fn check_if_file_is_changing(&mut self, fsn: &FsNode, source_path: &Path) -> bool {
        debug_assert!(fsn.node_type.is_file());

        let now = Instant::now();
        let state = self
            .file_changing
            .entry(source_path.to_path_buf())
            .or_insert(FileChangingState {
                first_seen: now,
                last_check: None,
                last_size: fsn.size,
            });

        if now.duration_since(state.first_seen) > self.options.file_update_max_delay {
            warn!(path = %source_path.display(), "timed out waiting for file to settle");
            self.file_changing.remove(source_path);
            return false;
        }

        let mut wait = false;
        match self.fs.open(source_path, false) {
            Ok(handle) => {
                let stat = handle.stat().clone();
                match state.last_check {
                    Some(last) if now.duration_since(last) < self.options.file_update_delay => {
                        debug!(path = %source_path.display(), "checked too recently, waiting");
                        wait = true;
                    }
                    Some(_) if stat.size != state.last_size => {
                        debug!(
                            path = %source_path.display(),
                            last = state.last_size,
                            current = stat.size,
                            "file size still changing, waiting"
                        );
                        state.last_size = stat.size;
                        state.last_check = Some(now);
                        wait = true;
                    }
                    None => {
                        state.last_check = Some(now);
                        state.last_size = stat.size;
                        wait = !self.options.file_update_delay.is_zero();
                    }
                    _ => {}
                }

                if !wait {
                    let now_secs = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map_or(0, |d| d.as_secs() as i64);
                    let age = now_secs.saturating_sub(stat.mtime);
                    if age >= 0 && (age as u64) < self.options.file_update_delay.as_secs() {
                        debug!(path = %source_path.display(), "modified too recently, waiting");
                        wait = true;
                    }
                }
            }
            Err(err) if err.is_transient() => {
                debug!(path = %source_path.display(), "move origin temporarily blocked, waiting");
                wait = true;
            }
            Err(_) => {
                debug!(path = %source_path.display(), "nothing at the move origin");
            }
        }

        if !wait {
            self.file_changing.remove(source_path);
        }
        wait
    }
}
