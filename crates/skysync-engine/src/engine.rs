//! The recursive reconciler.
//!
//! [`Sync`] owns one local/remote pairing: the reconciled tree, the scan
//! pool, the state-cache staging buffers and the collaborator ports. One
//! call to [`Sync::tick`] performs a full pass: it walks every flagged
//! subtree, aligns the three views of each directory into rows, applies one
//! transition per row and reaggregates the scheduling flags.
//!
//! Destructive transitions (deleting a reconciled node, moving an entry to
//! debris) only run once `scans_and_moves_complete` holds, i.e. the
//! previous pass performed no scans and actioned no moves. Until then a
//! vanished entry is assumed to be the source of a move that has not been
//! discovered yet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use skysync_core::config::{EngineOptions, SyncConfig};
use skysync_core::domain::fingerprint::fingerprints_equal;
use skysync_core::domain::{CloudNode, FsNode, NodeHandle, NodeType, TreeState};
use skysync_core::ports::{CloudError, ICloudDrive, IFileSystem, IStateStore, NameCase, StoreError};

use crate::debris::move_to_local_debris;
use crate::moves::FileChangingState;
use crate::scanner::{ScanCookie, ScanRequest, ScanService};
use crate::statecache::StateCache;
use crate::tree::{NodeId, SyncNode, SyncTree};
use crate::triplet::{compute_triplets, SyncChildRef, SyncRow};

/// Lifecycle of one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// First walk over a freshly-started (possibly restored) tree.
    InitialScan,
    /// Steady state: reacting to notifications and remote changes.
    Active,
    /// Torn down by the user; resources released.
    Canceled,
    /// Unrecoverable failure (state store unusable).
    Failed,
}

/// Notifications surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Both sides of a row changed; nothing destructive was done.
    Conflict { path: PathBuf },
    /// A never-synced row differed on both sides and one was chosen.
    WinnerPicked { path: PathBuf, local_won: bool },
    /// A local or remote move was recognised and replayed.
    MoveDetected { from: PathBuf, to: PathBuf },
}

/// Errors surfaced from a pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error("sync is no longer running ({0:?})")]
    NotRunning(SyncState),
}

/// Cross-pass bookkeeping for the move/deletion stability gate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncFlags {
    /// A move or rename was issued during the current pass.
    pub actioned_moves_renames: bool,
    /// A scan was pending or performed during the current pass.
    pub performed_scans: bool,
    /// The previous pass was quiescent, so vanished entries may now be
    /// treated as deletions.
    pub scans_and_moves_complete: bool,
}

/// One configured sync pairing and all of its working state.
pub struct Sync {
    pub(crate) config: SyncConfig,
    pub(crate) options: EngineOptions,
    pub(crate) fs: Arc<dyn IFileSystem>,
    pub(crate) cloud: Box<dyn ICloudDrive>,
    pub(crate) tree: SyncTree,
    pub(crate) scan_service: ScanService,
    pub(crate) scan_request: Option<ScanRequest>,
    pub(crate) state_cache: StateCache,
    pub(crate) flags: SyncFlags,
    pub(crate) state: SyncState,
    pub(crate) name_case: NameCase,
    pub(crate) debris_path: PathBuf,
    pub(crate) file_changing: HashMap<PathBuf, FileChangingState>,
    pub(crate) quiet_until: Option<Instant>,
    events: Option<UnboundedSender<SyncEvent>>,
}

impl Sync {
    /// Builds a sync over the given collaborators, restoring the reconciled
    /// tree from `store` when one is supplied.
    pub fn new(
        config: SyncConfig,
        options: EngineOptions,
        fs: Arc<dyn IFileSystem>,
        cloud: Box<dyn ICloudDrive>,
        store: Option<Box<dyn IStateStore>>,
    ) -> Result<Self, SyncError> {
        let debris_path = config.debris_path();
        let name_case = fs.name_case(&config.local_root);

        let mut tree = SyncTree::new(&config.local_root, config.remote_root);
        let mut state_cache = StateCache::new(store);

        // If the root now lives on a different volume, none of the stored
        // filesystem ids mean anything anymore.
        let fsids_trusted = fs.fsids_stable()
            && match (config.volume_fingerprint, fs.volume_fingerprint(&config.local_root)) {
                (Some(saved), Some(current)) if saved != current => {
                    warn!(saved, current, "sync root volume changed, dropping stored fsids");
                    false
                }
                _ => true,
            };
        let restored = state_cache.load(&mut tree, fs.as_ref(), fsids_trusted)?;
        if restored > 0 {
            info!(nodes = restored, "restored reconciled tree");
        }

        let scan_service =
            ScanService::new(Arc::clone(&fs), debris_path.clone(), options.scan_workers);

        let root = tree.root();
        tree.set_future_scan(root, true, true);
        tree.set_future_sync(root, true, true);

        Ok(Self {
            config,
            options,
            fs,
            cloud,
            tree,
            scan_service,
            scan_request: None,
            state_cache,
            // Never destructive on the very first pass: it has not had a
            // chance to discover in-flight moves yet.
            flags: SyncFlags {
                actioned_moves_renames: true,
                performed_scans: true,
                scans_and_moves_complete: false,
            },
            state: SyncState::InitialScan,
            name_case,
            debris_path,
            file_changing: HashMap::new(),
            quiet_until: None,
            events: None,
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// The cookie scan completions wake; the run loop awaits it.
    pub fn scan_cookie(&self) -> Arc<ScanCookie> {
        self.scan_service.cookie()
    }

    /// Creates the event channel and returns its receiving end.
    pub fn take_events(&mut self) -> UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ------------------------------------------------------------------
    // External triggers
    // ------------------------------------------------------------------

    /// Handles a filesystem notification: flags the deepest known node for
    /// rescanning and starts the notification quiet time.
    pub fn note_path_changed(&mut self, path: &Path) {
        let Some((node, remainder)) = self.tree.node_by_path(path) else {
            debug!(path = %path.display(), "notification outside the sync root");
            return;
        };

        // An exact hit means the entry itself changed, so its parent's
        // listing is what needs rereading. Unmatched components below a
        // known folder mean new content somewhere in that subtree.
        let (target, below) = if remainder {
            let n = self.tree.node(node).expect("resolved node");
            if n.node_type.is_file() {
                (n.parent.unwrap_or(node), true)
            } else {
                (node, true)
            }
        } else {
            let parent = self.tree.node(node).and_then(|n| n.parent);
            (parent.unwrap_or(node), false)
        };
        self.tree.set_future_scan(target, true, below);

        let delay = if self.options.is_network {
            self.options.extra_scanning_delay
        } else {
            self.options.scanning_delay
        };
        self.quiet_until = Some(Instant::now() + delay);
    }

    /// Handles a remote-change acknowledgement for `handle`: flags the
    /// affected rows (or the whole tree when the node is not known yet).
    pub fn cloud_changed(&mut self, handle: NodeHandle) {
        // The node's current remote parent is where a moved node must be
        // reconciled into; flag the matching local level too.
        if let Some(parent_handle) = self.cloud.node(handle).and_then(|n| n.parent) {
            for id in self.tree.nodes_by_handle(parent_handle).to_vec() {
                self.tree.set_future_sync(id, true, false);
            }
        }

        let ids: Vec<NodeId> = self.tree.nodes_by_handle(handle).to_vec();
        if ids.is_empty() {
            let root = self.tree.root();
            self.tree.set_future_sync(root, true, true);
            return;
        }
        for id in ids {
            self.tree.set_future_sync(id, true, false);
            if let Some(parent) = self.tree.node(id).and_then(|n| n.parent) {
                self.tree.set_future_sync(parent, true, false);
            }
        }
    }

    /// Flags the whole tree for a scan and reconcile.
    pub fn request_full_sync(&mut self) {
        let root = self.tree.root();
        self.tree.set_future_scan(root, true, true);
        self.tree.set_future_sync(root, true, true);
    }

    /// Tears the sync down: drops persisted state, cancels subtree
    /// transfers, abandons outstanding scans.
    pub fn cancel(&mut self) {
        info!(tag = self.config.tag, "cancelling sync");
        self.state = SyncState::Canceled;
        self.state_cache.destroy_store();
        self.cloud.cancel_transfers_below(self.config.remote_root);
        // The outstanding scan finishes into the weak cookie and is
        // discarded.
        self.scan_request = None;
    }

    // ------------------------------------------------------------------
    // One pass
    // ------------------------------------------------------------------

    /// Runs one reconciliation pass. Returns whether the tree is fully
    /// synced and no scan is outstanding.
    pub fn tick(&mut self) -> Result<bool, SyncError> {
        match self.state {
            SyncState::Canceled | SyncState::Failed => {
                return Err(SyncError::NotRunning(self.state));
            }
            _ => {}
        }

        if let Some(quiet) = self.quiet_until {
            if Instant::now() < quiet {
                return Ok(false);
            }
            self.quiet_until = None;
        }

        // A vanished entry may only be treated as a deletion once a whole
        // pass went by with no scans pending and no moves actioned.
        let previous = self.flags;
        self.flags.scans_and_moves_complete = !previous.actioned_moves_renames
            && !previous.performed_scans
            && self.scan_request.is_none();
        self.flags.actioned_moves_renames = false;
        self.flags.performed_scans = false;

        let root = self.tree.root();
        let root_path = PathBuf::from(self.tree.node(root).expect("root").name.clone());
        let cloud_root = self.cloud.node(self.config.remote_root);
        if cloud_root.is_none() {
            // The remote tree has not produced the root yet (startup, or a
            // reconnect in progress). Acting now would read as everything
            // being deleted remotely.
            warn!(root = %self.config.remote_root, "remote root unavailable, skipping pass");
            return Ok(false);
        }

        let synced = self.recursive_sync(root, cloud_root, root_path);

        match self.state_cache.flush(&mut self.tree) {
            Ok(()) => {}
            Err(err @ StoreError::Closed) => {
                error!(error = %err, "state store unusable");
                self.state = SyncState::Failed;
                return Err(err.into());
            }
            Err(err) => {
                // Only this pass's transaction is lost; the staging queues
                // retry on the next flush.
                error!(error = %err, "state cache flush failed");
            }
        }

        let done = synced && self.scan_request.is_none();
        if done && self.state == SyncState::InitialScan {
            info!("initial scan complete");
            self.state = SyncState::Active;
        }
        Ok(done)
    }

    // ------------------------------------------------------------------
    // Tree-recursive reconciliation
    // ------------------------------------------------------------------

    fn recursive_sync(
        &mut self,
        node: NodeId,
        cloud: Option<CloudNode>,
        local_path: PathBuf,
    ) -> bool {
        let Some(n) = self.tree.node(node) else {
            return true;
        };
        if !(n.scan_required() || n.sync_required()) {
            return true;
        }
        debug!(
            path = %local_path.display(),
            scan = ?n.flags.scan_again,
            sync = ?n.flags.sync_again,
            "entering folder"
        );

        // Hand subtree-wide flags down so this level's flag can clear.
        let child_ids = n.child_ids();
        for child in &child_ids {
            self.tree.inherit_subtree_flags(node, *child);
        }

        let was_synced = !self
            .tree
            .node(node)
            .expect("live node")
            .flags
            .sync_again
            .needs_action();
        let mut sync_here = !was_synced;

        // Scan gating: one outstanding request at a time, and no directory
        // is rescanned more often than the configured interval.
        if self.tree.node(node).expect("live node").flags.scan_again.needs_action() {
            self.flags.performed_scans = true;

            let rescan_ok = self
                .tree
                .node(node)
                .expect("live node")
                .last_scan
                .map_or(true, |t| t.elapsed() >= self.options.min_rescan_interval);

            let outstanding = self.scan_request.as_ref();
            if outstanding.is_none() && rescan_ok {
                debug!(path = %local_path.display(), "requesting scan");
                let known = self.known_children(node);
                self.scan_request =
                    Some(self.scan_service.scan(node, local_path.clone(), known));
                sync_here = false;
            } else if outstanding.is_some_and(|r| r.matches(node) && r.completed()) {
                debug!(path = %local_path.display(), "received scan results");
                let request = self.scan_request.take().expect("checked above");
                let results = request.results();
                let n = self.tree.node_mut(node).expect("live node");
                n.rare().last_folder_scan = Some(results);
                n.last_scan = Some(Instant::now());
                n.flags.scan_again = TreeState::Resolved;
                self.tree.set_future_sync(node, true, false);
                sync_here = true;
            } else {
                sync_here = false;
            }
        } else {
            // Restored from the children at the end if anything below
            // still needs scanning.
            self.tree.node_mut(node).expect("live node").flags.scan_again = TreeState::Resolved;
        }

        // Effective children: the last scan when present, otherwise the
        // reconciled children reprojected as filesystem entries.
        let effective: Vec<FsNode> = {
            let from_scan = self
                .tree
                .node(node)
                .and_then(|n| n.rare_ref())
                .and_then(|r| r.last_folder_scan.clone());
            match from_scan {
                Some(scan) => scan,
                None => child_ids
                    .iter()
                    .filter_map(|c| self.tree.node(*c).and_then(SyncNode::known_fs_details))
                    .collect(),
            }
        };

        let sync_children: Vec<SyncChildRef> = child_ids
            .iter()
            .filter_map(|c| {
                let n = self.tree.node(*c)?;
                Some(SyncChildRef {
                    id: *c,
                    name: n.name.clone(),
                    fsid: n.fsid,
                    synced_handle: n.synced_handle,
                })
            })
            .collect();
        let cloud_children = cloud
            .as_ref()
            .map(|c| self.cloud.children(c.handle))
            .unwrap_or_default();

        let mut rows = compute_triplets(effective, sync_children, cloud_children, self.name_case);

        let mut folder_synced = sync_here;
        let mut subfolders_synced = true;
        self.tree.node_mut(node).expect("live node").flags.conflicts = TreeState::Resolved;

        // Hold this level while remote commands for it are in flight.
        let sync_here = sync_here && cloud.as_ref().is_none_or(|c| !c.has_pending_changes);

        let assign_fsids = self.state == SyncState::InitialScan
            && !self.tree.node(node).expect("live node").flags.fsids_assigned
            && self.fs.fsids_stable();

        // Pass 1: per-row transitions. Renames within the folder settle
        // before any recursion below it.
        for row in rows.iter_mut() {
            if row.has_clashes() {
                self.tree.note_conflict(node);
            }
            let Some(name) = row.name().map(str::to_string) else {
                continue;
            };
            let child_path = local_path.join(&name);

            if assign_fsids {
                self.assign_restored_fsid(row);
            }

            if sync_here && !self.sync_item(row, node, cloud.as_ref(), &child_path) {
                folder_synced = false;
            }
        }
        if assign_fsids {
            self.tree.node_mut(node).expect("live node").flags.fsids_assigned = true;
        }

        // Pass 2: recursion.
        for row in rows.iter_mut() {
            if row.suppress_recursion {
                continue;
            }
            let Some(sref) = &row.sync else { continue };
            let Some(child) = self.tree.node(sref.id) else {
                continue;
            };
            if !child.node_type.is_folder() {
                continue;
            }
            let child_path = local_path.join(&child.name);
            if !self.recursive_sync(sref.id, row.cloud.clone(), child_path) {
                subfolders_synced = false;
            }
        }

        if folder_synced {
            // The reconciled children now agree with the last scan.
            let n = self.tree.node_mut(node).expect("live node");
            n.rare().last_folder_scan = None;
            n.trim_rare();
        }

        if self.flags.scans_and_moves_complete
            && ((sync_here && folder_synced) || (!sync_here && was_synced))
        {
            self.tree.node_mut(node).expect("live node").flags.sync_again = TreeState::Resolved;
        }

        // Reaggregate this level's flags from whatever the pass left on
        // the children.
        let children_now = self
            .tree
            .node(node)
            .map(|n| n.child_ids())
            .unwrap_or_default();
        for child in children_now {
            self.tree.aggregate_from_child(node, child);
        }

        debug!(
            path = %local_path.display(),
            synced = folder_synced,
            subsync = subfolders_synced,
            "exiting folder"
        );
        folder_synced && subfolders_synced
    }

    /// During the initial scan, a restored node with no usable fsid adopts
    /// the id of an equal filesystem entry paired with it.
    fn assign_restored_fsid(&mut self, row: &mut SyncRow) {
        let (Some(sref), Some(fsn)) = (&row.sync, &row.fs) else {
            return;
        };
        let Some(node) = self.tree.node(sref.id) else {
            return;
        };
        if node.fsid.is_none() && fsn.fsid.is_some() && sync_equal_fs(fsn, node) {
            self.tree.set_fsid(sref.id, fsn.fsid);
            let db_id = self.tree.node(sref.id).and_then(|n| n.db_id);
            self.state_cache.add(sref.id, db_id);
        }
    }

    fn known_children(&self, node: NodeId) -> HashMap<String, FsNode> {
        self.tree
            .node(node)
            .map(|n| n.child_ids())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| self.tree.node(c).and_then(SyncNode::known_fs_details))
            .map(|d| (d.name.clone(), d))
            .collect()
    }

    // ------------------------------------------------------------------
    // Per-row transitions
    // ------------------------------------------------------------------

    /// Applies one transition to a row. Returns whether the row is synced.
    fn sync_item(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        parent_cloud: Option<&CloudNode>,
        full_path: &Path,
    ) -> bool {
        // Shortname records can be stale after a restart; adopt what the
        // scan saw.
        if let (Some(sref), Some(fsn)) = (&row.sync, &row.fs) {
            if fsn.short_name.is_some() {
                let recorded = self.tree.node(sref.id).and_then(|n| n.short_name.clone());
                if recorded != fsn.short_name {
                    warn!(
                        path = %full_path.display(),
                        new = ?fsn.short_name,
                        old = ?recorded,
                        "updating stale shortname"
                    );
                    self.tree.update_shortname(sref.id, fsn.short_name.clone());
                    let db_id = self.tree.node(sref.id).and_then(|n| n.db_id);
                    self.state_cache.add(sref.id, db_id);
                }
            }
        }

        // Blocked rows wait for their timers.
        if let Some(sref) = &row.sync {
            let id = sref.id;
            let flags = self.tree.node(id).map(|n| n.flags);
            if let Some(flags) = flags {
                if flags.use_blocked.needs_action() {
                    let armed = self
                        .tree
                        .node(id)
                        .and_then(|n| n.rare_ref())
                        .and_then(|r| r.use_blocked_timer.as_ref())
                        .is_none_or(|t| t.armed());
                    if !armed {
                        debug!(path = %full_path.display(), "waiting on use-blocked timer");
                        return false;
                    }
                }
                if flags.scan_blocked.needs_action() {
                    let armed = self
                        .tree
                        .node(id)
                        .and_then(|n| n.rare_ref())
                        .and_then(|r| r.scan_blocked_timer.as_ref())
                        .is_none_or(|t| t.armed());
                    if armed {
                        debug!(path = %full_path.display(), "scan-blocked timer elapsed, rescanning parent");
                        self.tree.set_future_scan(parent, true, false);
                    } else {
                        debug!(path = %full_path.display(), "waiting on scan-blocked timer");
                        return false;
                    }
                }
            }
        }

        // A node recorded while its entry was unreadable completes its
        // initialization once a real scan result arrives.
        if let (Some(sref), Some(fsn)) = (&row.sync, &row.fs) {
            let is_unknown = self
                .tree
                .node(sref.id)
                .is_some_and(|n| n.node_type == NodeType::Unknown);
            if is_unknown && fsn.node_type != NodeType::Unknown {
                let n = self.tree.node_mut(sref.id).expect("live node");
                n.node_type = fsn.node_type;
                n.fingerprint = fsn.fingerprint;
                if fsn.node_type.is_folder() {
                    self.tree.set_future_scan(sref.id, true, true);
                }
                let db_id = self.tree.node(sref.id).and_then(|n| n.db_id);
                self.state_cache.add(sref.id, db_id);
            }
        }

        // Clear blocked markers; anything still blocked at or below will
        // set them again this pass.
        if let Some(sref) = &row.sync {
            if let Some(n) = self.tree.node_mut(sref.id) {
                if n.flags.use_blocked.pending() {
                    n.flags.use_blocked = TreeState::Resolved;
                    n.rare().use_blocked_timer = None;
                }
                if n.flags.scan_blocked.pending() {
                    n.flags.scan_blocked = TreeState::Resolved;
                    n.rare().scan_blocked_timer = None;
                }
                n.trim_rare();
            }
        }

        // The scan could not interrogate this entry; park it and retry on
        // a later rescan of the parent.
        let fs_unusable = row
            .fs
            .as_ref()
            .is_some_and(|f| f.node_type == NodeType::Unknown || f.is_blocked);
        if fs_unusable {
            debug!(path = %full_path.display(), "entry was unreadable during scan, retry later");
            if row.sync.is_none() {
                self.resolve_make_sync_node_from_fs(row, parent, full_path);
            }
            if let Some(sref) = &row.sync {
                self.tree.set_scan_blocked(sref.id);
            }
            return false;
        }

        // Move detection runs before the transition table so a relocated
        // entry is never handled as delete-plus-create.
        let fs_identity_changed = match (&row.fs, &row.sync) {
            (Some(_), None) => true,
            (Some(fsn), Some(sref)) => self
                .tree
                .node(sref.id)
                .is_some_and(|n| n.fsid.is_some() && n.fsid != fsn.fsid),
            _ => false,
        };
        if fs_identity_changed {
            if let Some(result) = self.check_local_moves_renames(row, parent, parent_cloud, full_path)
            {
                return result;
            }
        }

        let cloud_identity_changed = match (&row.cloud, &row.sync) {
            (Some(_), None) => true,
            (Some(cn), Some(sref)) => self.tree.node(sref.id).is_some_and(|n| {
                n.synced_handle.is_some() && n.synced_handle != Some(cn.handle)
            }),
            _ => false,
        };
        if cloud_identity_changed {
            if let Some(result) = self.check_cloud_moves_renames(row, parent, full_path) {
                return result;
            }
        }

        self.apply_transition(row, parent, parent_cloud, full_path)
    }

    /// The eight presence combinations of `(sync, fs, cloud)`.
    fn apply_transition(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        parent_cloud: Option<&CloudNode>,
        full_path: &Path,
    ) -> bool {
        let sync_view = row
            .sync
            .as_ref()
            .and_then(|s| self.tree.node(s.id))
            .map(|n| (n.fsid, n.synced_handle));

        match (sync_view, row.fs.is_some(), row.cloud.is_some()) {
            (Some(_), true, true) => self.reconcile_full_row(row, parent, parent_cloud, full_path),

            (Some((_, synced_handle)), true, false) => {
                if synced_handle.is_none() {
                    // Never existed remotely: a fresh local entry.
                    self.resolve_upsync(row, parent_cloud, full_path)
                } else {
                    self.resolve_cloud_node_gone(row, parent, full_path)
                }
            }

            (Some((fsid, _)), false, true) => {
                if fsid.is_some() {
                    // Was on disk before and now is not.
                    self.resolve_fs_node_gone(row, parent, full_path)
                } else {
                    self.resolve_downsync(row, parent, full_path)
                }
            }

            (Some(_), false, false) => self.resolve_del_sync_node(row),

            (None, true, true) => {
                let fsn = row.fs.as_ref().expect("checked");
                let cn = row.cloud.as_ref().expect("checked");
                if fsn.node_type != cn.node_type {
                    self.resolve_user_intervention(row, parent, full_path)
                } else if !fsn.node_type.is_file()
                    || fingerprints_equal(fsn.fingerprint.as_ref(), cn.fingerprint.as_ref())
                {
                    self.resolve_make_sync_node_from_fs(row, parent, full_path)
                } else {
                    self.resolve_pick_winner(row, parent, full_path)
                }
            }

            (None, true, false) => self.resolve_make_sync_node_from_fs(row, parent, full_path),

            (None, false, true) => self.resolve_make_sync_node_from_cloud(row, parent, full_path),

            (None, false, false) => {
                // Only clash markers live here; the conflict was already
                // recorded on the parent.
                false
            }
        }
    }

    /// All three views present: decide between bind, upsync, downsync and
    /// conflict.
    fn reconcile_full_row(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        parent_cloud: Option<&CloudNode>,
        full_path: &Path,
    ) -> bool {
        let id = row.sync.as_ref().expect("checked").id;
        let fsn = row.fs.as_ref().expect("checked");
        let cn = row.cloud.as_ref().expect("checked");
        let node = self.tree.node(id).expect("live node");

        let cloud_equal = sync_equal_cloud(cn, node);
        let fs_equal = sync_equal_fs(fsn, node);
        // The two live sides agreeing with each other covers the moment a
        // transfer or replayed move lands: both sides hold the new state
        // before the reconciled view has recorded it.
        let sides_equal = fsn.node_type == cn.node_type
            && (!fsn.node_type.is_file()
                || fingerprints_equal(fsn.fingerprint.as_ref(), cn.fingerprint.as_ref()));

        if (cloud_equal && fs_equal) || sides_equal {
            let rebind = node.fsid != fsn.fsid
                || node.synced_handle != Some(cn.handle)
                || node.fingerprint != fsn.fingerprint;
            if rebind {
                debug!(path = %full_path.display(), "row is synced, binding identity");
                let fingerprint = fsn.fingerprint;
                self.tree.set_fsid(id, fsn.fsid);
                self.tree.set_synced_handle(id, Some(cn.handle));
                let n = self.tree.node_mut(id).expect("live node");
                if n.node_type.is_file() {
                    n.fingerprint = fingerprint;
                }
                let db_id = self.tree.node(id).and_then(|n| n.db_id);
                self.state_cache.add(id, db_id);
            }
            if let Some(n) = self.tree.node_mut(id) {
                n.transfer = None;
            }
            true
        } else if cloud_equal {
            self.resolve_upsync(row, parent_cloud, full_path)
        } else if fs_equal {
            self.resolve_downsync(row, parent, full_path)
        } else {
            self.resolve_user_intervention(row, parent, full_path)
        }
    }

    // ------------------------------------------------------------------
    // Row resolutions
    // ------------------------------------------------------------------

    pub(crate) fn resolve_make_sync_node_from_fs(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        full_path: &Path,
    ) -> bool {
        let fsn = row.fs.as_ref().expect("filesystem view present");
        debug!(path = %full_path.display(), "creating reconciled node from filesystem");

        let id = self.tree.add_child(
            parent,
            fsn.name.clone(),
            fsn.short_name.clone(),
            fsn.node_type,
        );
        if fsn.node_type.is_file() {
            self.tree.node_mut(id).expect("just added").fingerprint = fsn.fingerprint;
        }
        self.tree.set_fsid(id, fsn.fsid);
        if fsn.node_type.is_folder() {
            self.tree.set_future_scan(id, true, true);
        }
        self.state_cache.add(id, None);
        self.tree.set_future_scan(parent, true, false);

        row.sync = Some(SyncChildRef {
            id,
            name: fsn.name.clone(),
            fsid: fsn.fsid,
            synced_handle: None,
        });
        false
    }

    pub(crate) fn resolve_make_sync_node_from_cloud(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        full_path: &Path,
    ) -> bool {
        let cn = row.cloud.as_ref().expect("cloud view present");
        debug!(path = %full_path.display(), "creating reconciled node from cloud");

        let id = self.tree.add_child(parent, cn.name.clone(), None, cn.node_type);
        if cn.node_type.is_file() {
            self.tree.node_mut(id).expect("just added").fingerprint = cn.fingerprint;
        }
        self.tree.set_synced_handle(id, Some(cn.handle));
        if cn.node_type.is_folder() {
            self.tree.set_future_scan(id, true, true);
        }
        self.state_cache.add(id, None);
        self.tree.set_future_scan(parent, true, false);

        row.sync = Some(SyncChildRef {
            id,
            name: cn.name.clone(),
            fsid: None,
            synced_handle: Some(cn.handle),
        });
        false
    }

    fn resolve_del_sync_node(&mut self, row: &mut SyncRow) -> bool {
        if !self.flags.scans_and_moves_complete {
            return false;
        }
        if let Some(sref) = row.sync.take() {
            debug!("both sides gone, removing reconciled node");
            let removed = self.tree.destroy(sref.id);
            for gone in removed {
                self.state_cache.remove(sref.id, gone.db_id);
                if gone.transfer.is_some() {
                    if let Some(handle) = gone.synced_handle {
                        self.cloud.cancel_transfers_below(handle);
                    }
                }
            }
        }
        false
    }

    fn resolve_upsync(
        &mut self,
        row: &mut SyncRow,
        parent_cloud: Option<&CloudNode>,
        full_path: &Path,
    ) -> bool {
        let Some(sref) = &row.sync else { return false };
        let id = sref.id;
        let Some(node) = self.tree.node(id) else {
            return false;
        };
        let name = node.name.clone();
        // The scanned entry decides file vs folder; the reconciled view can
        // lag behind a type change.
        let entry_type = row.fs.as_ref().map_or(node.node_type, |f| f.node_type);

        if entry_type.is_file() {
            if node.transfer.is_some() {
                debug!(path = %full_path.display(), "upload already in progress");
                return false;
            }
            let Some(pc) = parent_cloud else {
                debug!(path = %full_path.display(), "parent cloud folder does not exist yet");
                return false;
            };
            let fingerprint = row.fs.as_ref().and_then(|f| f.fingerprint).or(node.fingerprint);
            let Some(fingerprint) = fingerprint else {
                return false;
            };
            debug!(path = %full_path.display(), "uploading file");
            match self.cloud.start_upload(pc.handle, &name, full_path, fingerprint) {
                Ok(transfer) => {
                    self.tree.node_mut(id).expect("live node").transfer = Some(transfer);
                }
                Err(CloudError::PermissionDenied) => {
                    warn!(path = %full_path.display(), "upload not permitted");
                }
                Err(err) => {
                    warn!(path = %full_path.display(), error = %err, "upload failed to start");
                }
            }
        } else if let Some(pc) = parent_cloud {
            debug!(path = %full_path.display(), "creating cloud folder");
            if let Err(err) = self.cloud.put_folder(pc.handle, &name) {
                warn!(path = %full_path.display(), error = %err, "folder creation failed");
            }
        }
        false
    }

    fn resolve_downsync(&mut self, row: &mut SyncRow, parent: NodeId, full_path: &Path) -> bool {
        let Some(cn) = &row.cloud else { return false };

        if cn.node_type.is_file() {
            let Some(sref) = &row.sync else { return false };
            let in_progress = self
                .tree
                .node(sref.id)
                .is_some_and(|n| n.transfer.is_some());
            if in_progress {
                debug!(path = %full_path.display(), "download already in progress");
                return false;
            }
            debug!(path = %full_path.display(), "start fetching file");
            match self.cloud.start_download(cn.handle, full_path) {
                Ok(transfer) => {
                    if let Some(n) = self.tree.node_mut(sref.id) {
                        n.transfer = Some(transfer);
                    }
                }
                Err(err) => {
                    warn!(path = %full_path.display(), error = %err, "download failed to start");
                }
            }
        } else {
            debug!(path = %full_path.display(), "creating local folder");
            match self.fs.mkdir(full_path, false) {
                Ok(()) => {
                    self.tree.set_future_scan(parent, true, false);
                }
                Err(err) => {
                    warn!(path = %full_path.display(), error = %err, "folder creation blocked");
                    if let Some(sref) = &row.sync {
                        self.tree.set_use_blocked(sref.id);
                    }
                }
            }
        }
        false
    }

    fn resolve_user_intervention(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        full_path: &Path,
    ) -> bool {
        warn!(path = %full_path.display(), "both sides changed, flagging for the user");
        let target = row.sync.as_ref().map_or(parent, |s| s.id);
        self.tree.note_conflict(target);
        self.emit(SyncEvent::Conflict {
            path: full_path.to_path_buf(),
        });
        false
    }

    fn resolve_pick_winner(&mut self, row: &mut SyncRow, parent: NodeId, full_path: &Path) -> bool {
        let fsn = row.fs.as_ref().expect("filesystem view present");
        let cn = row.cloud.as_ref().expect("cloud view present");

        let local_mtime = fsn.fingerprint.map_or(fsn.mtime, |f| f.mtime);
        let cloud_mtime = cn.fingerprint.map_or(0, |f| f.mtime);
        let local_won = local_mtime >= cloud_mtime;

        info!(
            path = %full_path.display(),
            local_won,
            "never-synced row differs on both sides, newer side wins"
        );
        self.emit(SyncEvent::WinnerPicked {
            path: full_path.to_path_buf(),
            local_won,
        });

        // Bind the losing side's state as the last-synced view; the winner
        // then reads as the newer change and flows through the normal
        // up/down path on the next pass.
        if local_won {
            self.resolve_make_sync_node_from_cloud(row, parent, full_path)
        } else {
            self.resolve_make_sync_node_from_fs(row, parent, full_path)
        }
    }

    fn resolve_cloud_node_gone(
        &mut self,
        row: &mut SyncRow,
        parent: NodeId,
        full_path: &Path,
    ) -> bool {
        if self.flags.scans_and_moves_complete {
            // Had the node been moved somewhere visible, the corresponding
            // local move would already have been replayed.
            debug!(path = %full_path.display(), "moving local item to local debris");
            if move_to_local_debris(self.fs.as_ref(), &self.debris_path, full_path) {
                row.suppress_recursion = true;
                self.tree.set_future_scan(parent, true, false);
            } else {
                error!(path = %full_path.display(), "failed to move to local debris");
            }
        }
        false
    }

    fn resolve_fs_node_gone(&mut self, row: &mut SyncRow, _parent: NodeId, full_path: &Path) -> bool {
        let Some(sref) = &row.sync else { return false };
        let id = sref.id;

        let deleting = self.tree.node(id).is_some_and(|n| n.flags.deleting);
        if self.flags.scans_and_moves_complete && !deleting {
            if let Some(cn) = &row.cloud {
                debug!(path = %full_path.display(), "moving cloud item to sync debris");
                match self.cloud.move_to_sync_debris(cn.handle) {
                    Ok(_) => {
                        self.tree.node_mut(id).expect("live node").flags.deleting = true;
                    }
                    Err(err) => {
                        warn!(path = %full_path.display(), error = %err, "sync debris move failed");
                    }
                }
            }
        }

        if self.tree.node(id).is_some_and(|n| n.flags.deleting) {
            row.suppress_recursion = true;
        }
        false
    }
}

/// Content equality between a scanned entry and the reconciled view.
/// Names already matched during pairing; folders compare by type alone.
pub(crate) fn sync_equal_fs(fsn: &FsNode, node: &SyncNode) -> bool {
    fsn.node_type == node.node_type
        && (!fsn.node_type.is_file()
            || fingerprints_equal(fsn.fingerprint.as_ref(), node.fingerprint.as_ref()))
}

/// Content equality between a cloud node and the reconciled view.
pub(crate) fn sync_equal_cloud(cn: &CloudNode, node: &SyncNode) -> bool {
    cn.node_type == node.node_type
        && (!cn.node_type.is_file()
            || fingerprints_equal(cn.fingerprint.as_ref(), node.fingerprint.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_core::domain::FileFingerprint;
    use std::path::Path;

    fn fp(crc: u32) -> FileFingerprint {
        FileFingerprint {
            size: 4,
            mtime: 10,
            crc,
        }
    }

    fn tree_with_file(fingerprint: Option<FileFingerprint>) -> (SyncTree, NodeId) {
        let mut tree = SyncTree::new(Path::new("/r"), NodeHandle(1));
        let id = tree.add_child(tree.root(), "f".into(), None, NodeType::File);
        tree.node_mut(id).unwrap().fingerprint = fingerprint;
        (tree, id)
    }

    #[test]
    fn test_sync_equal_fs_compares_fingerprints() {
        let (tree, id) = tree_with_file(Some(fp(1)));
        let node = tree.node(id).unwrap();

        let mut fsn = FsNode::unknown("f".into());
        fsn.node_type = NodeType::File;
        fsn.fingerprint = Some(fp(1));
        assert!(sync_equal_fs(&fsn, node));

        fsn.fingerprint = Some(fp(2));
        assert!(!sync_equal_fs(&fsn, node));
    }

    #[test]
    fn test_sync_equal_rejects_type_mismatch() {
        let (tree, id) = tree_with_file(Some(fp(1)));
        let node = tree.node(id).unwrap();

        let mut fsn = FsNode::unknown("f".into());
        fsn.node_type = NodeType::Folder;
        assert!(!sync_equal_fs(&fsn, node));

        let cn = CloudNode::folder(NodeHandle(2), None, "f");
        assert!(!sync_equal_cloud(&cn, node));
    }

    #[test]
    fn test_sync_equal_folders_by_type_alone() {
        let mut tree = SyncTree::new(Path::new("/r"), NodeHandle(1));
        let id = tree.add_child(tree.root(), "d".into(), None, NodeType::Folder);
        let node = tree.node(id).unwrap();

        let cn = CloudNode::folder(NodeHandle(2), None, "d");
        assert!(sync_equal_cloud(&cn, node));
    }
}
