//! The persistent reconciled tree.
//!
//! One node exists per known path. Nodes live in a generational arena and
//! are addressed by [`NodeId`]; an id taken by a scan request or transfer
//! stays safe to hold after the node dies, it simply stops resolving.
//!
//! Three secondary indexes hang off the tree:
//! - children by name (case-sensitive, ordered) on each node,
//! - a shortname index on each node for entries whose legacy secondary name
//!   differs from the long one,
//! - tree-wide multimaps by filesystem id and by cloud handle, which drive
//!   move detection. These are multimaps because inode reuse can briefly put
//!   two nodes on one fsid.
//!
//! Every mutation of fsid, synced handle, or position goes through a
//! detach/attach pair here, so the indexes can never dangle.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;

use skysync_core::domain::treestate::{propagate_subtree, update_from_child};
use skysync_core::domain::{
    FileFingerprint, FsNode, Fsid, NodeHandle, NodeType, TransferId, TreeState,
};

use crate::backoff::BackoffTimer;

/// Weak token addressing one tree node: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Scheduling and lifecycle flags of one node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeFlags {
    /// This level (or below) needs a directory scan.
    pub scan_again: TreeState,
    /// This level (or below) needs a reconciliation pass.
    pub sync_again: TreeState,
    /// This row failed a filesystem operation and waits on a backoff timer.
    pub use_blocked: TreeState,
    /// This row could not be interrogated by a scan and waits on a backoff
    /// timer before the parent is rescanned.
    pub scan_blocked: TreeState,
    /// Name clashes or diverged edits were detected at or below this level.
    pub conflicts: TreeState,
    /// The remote counterpart is being moved to debris; recursion below is
    /// suppressed until the deletion settles.
    pub deleting: bool,
    /// Restored nodes in this folder already had fsids assigned from a scan.
    pub fsids_assigned: bool,
}

/// Rarely-populated per-node state, boxed to keep the common node small.
#[derive(Debug, Default)]
pub struct RareFields {
    pub use_blocked_timer: Option<BackoffTimer>,
    pub scan_blocked_timer: Option<BackoffTimer>,
    /// Results of the last folder scan; dropped once the folder is fully
    /// synced against them.
    pub last_folder_scan: Option<Vec<FsNode>>,
}

/// One reconciled node.
#[derive(Debug)]
pub struct SyncNode {
    /// Entry name. A single path component everywhere except the root,
    /// which stores the absolute path of the sync root.
    pub name: String,
    /// Legacy secondary name, kept only where it differs from `name`.
    pub short_name: Option<String>,
    pub node_type: NodeType,
    pub parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    shortname_children: HashMap<String, NodeId>,
    pub fsid: Option<Fsid>,
    pub synced_handle: Option<NodeHandle>,
    /// Content fingerprint of the synced state, files only.
    pub fingerprint: Option<FileFingerprint>,
    pub flags: NodeFlags,
    rare: Option<Box<RareFields>>,
    /// When this folder was last scanned.
    pub last_scan: Option<Instant>,
    /// Row id in the state store, once persisted.
    pub db_id: Option<u32>,
    /// In-flight byte transfer for this row, if any.
    pub transfer: Option<TransferId>,
}

impl SyncNode {
    fn new(name: String, short_name: Option<String>, node_type: NodeType) -> Self {
        Self {
            name,
            short_name,
            node_type,
            parent: None,
            children: BTreeMap::new(),
            shortname_children: HashMap::new(),
            fsid: None,
            synced_handle: None,
            fingerprint: None,
            flags: NodeFlags::default(),
            rare: None,
            last_scan: None,
            db_id: None,
            transfer: None,
        }
    }

    /// Child by (long) name, case-sensitive.
    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.children.get(name).copied()
    }

    /// Child by legacy secondary name.
    pub fn shortname_child(&self, name: &str) -> Option<NodeId> {
        self.shortname_children.get(name).copied()
    }

    /// Children ids in name order.
    pub fn child_ids(&self) -> Vec<NodeId> {
        self.children.values().copied().collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Lazily-allocated rare fields.
    pub fn rare(&mut self) -> &mut RareFields {
        self.rare.get_or_insert_with(Default::default)
    }

    pub fn rare_ref(&self) -> Option<&RareFields> {
        self.rare.as_deref()
    }

    /// Drops the rare-field allocation if everything in it is gone.
    pub fn trim_rare(&mut self) {
        if let Some(rare) = &self.rare {
            if rare.use_blocked_timer.is_none()
                && rare.scan_blocked_timer.is_none()
                && rare.last_folder_scan.is_none()
            {
                self.rare = None;
            }
        }
    }

    /// True if this subtree still needs scanning.
    pub fn scan_required(&self) -> bool {
        self.flags.scan_again.pending()
    }

    /// True if this subtree still needs reconciling.
    pub fn sync_required(&self) -> bool {
        self.flags.sync_again.pending()
    }

    /// Reprojects this node as the filesystem entry it was last known to
    /// be, used when a folder needs no fresh scan. `None` when the node was
    /// never seen on disk.
    pub fn known_fs_details(&self) -> Option<FsNode> {
        let fsid = self.fsid?;
        Some(FsNode {
            name: self.name.clone(),
            short_name: self.short_name.clone(),
            node_type: self.node_type,
            size: self.fingerprint.map_or(0, |f| f.size),
            mtime: self.fingerprint.map_or(0, |f| f.mtime),
            fsid: Some(fsid),
            is_symlink: false,
            is_blocked: false,
            fingerprint: self.fingerprint,
        })
    }
}

/// Selector for the flag a propagation walk updates.
#[derive(Debug, Clone, Copy)]
enum FlagField {
    ScanAgain,
    SyncAgain,
    UseBlocked,
    ScanBlocked,
    Conflicts,
}

impl FlagField {
    fn get_mut(self, flags: &mut NodeFlags) -> &mut TreeState {
        match self {
            FlagField::ScanAgain => &mut flags.scan_again,
            FlagField::SyncAgain => &mut flags.sync_again,
            FlagField::UseBlocked => &mut flags.use_blocked,
            FlagField::ScanBlocked => &mut flags.scan_blocked,
            FlagField::Conflicts => &mut flags.conflicts,
        }
    }
}

/// Everything the engine must clean up when a node is destroyed.
#[derive(Debug)]
pub struct RemovedNode {
    pub db_id: Option<u32>,
    pub synced_handle: Option<NodeHandle>,
    pub transfer: Option<TransferId>,
}

struct Slot {
    generation: u32,
    node: Option<SyncNode>,
}

/// The reconciled tree plus its secondary indexes.
pub struct SyncTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    fsid_index: HashMap<Fsid, Vec<NodeId>>,
    handle_index: HashMap<NodeHandle, Vec<NodeId>>,
}

impl SyncTree {
    /// Creates a tree whose root represents `root_path` paired with the
    /// remote folder `root_handle`.
    pub fn new(root_path: &Path, root_handle: NodeHandle) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            fsid_index: HashMap::new(),
            handle_index: HashMap::new(),
        };

        let mut root = SyncNode::new(
            root_path.to_string_lossy().into_owned(),
            None,
            NodeType::Folder,
        );
        root.synced_handle = Some(root_handle);
        tree.slots.push(Slot {
            generation: 0,
            node: Some(root),
        });
        tree.handle_index
            .entry(root_handle)
            .or_default()
            .push(tree.root);
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&SyncNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SyncNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    /// Creates a node under `parent`. The caller assigns fsid, handle and
    /// fingerprint through the setters so the indexes stay consistent.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: String,
        short_name: Option<String>,
        node_type: NodeType,
    ) -> NodeId {
        let mut node = SyncNode::new(name.clone(), short_name.clone(), node_type);
        node.parent = Some(parent);

        let id = self.insert_slot(node);
        let parent_node = self.node_mut(parent).expect("live parent");
        parent_node.children.insert(name, id);
        if let Some(short) = short_name {
            parent_node.shortname_children.insert(short, id);
        }
        id
    }

    /// Moves a node to a new parent and/or name, rewriting the affected
    /// child maps. Purely structural; any cloud-side rename is the caller's
    /// business.
    pub fn set_parent(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: String,
        new_short_name: Option<String>,
    ) {
        self.detach_from_parent(id);

        let node = self.node_mut(id).expect("live node");
        node.parent = Some(new_parent);
        node.name = new_name.clone();
        node.short_name = new_short_name.clone();

        let parent = self.node_mut(new_parent).expect("live parent");
        parent.children.insert(new_name, id);
        if let Some(short) = new_short_name {
            parent.shortname_children.insert(short, id);
        }
    }

    /// Replaces a node's recorded shortname and re-registers it in the
    /// parent's shortname index. Used when a scan shows the on-disk
    /// shortname drifted from the recorded one.
    pub fn update_shortname(&mut self, id: NodeId, new_short: Option<String>) {
        let (parent, old_short) = match self.node(id) {
            Some(n) => (n.parent, n.short_name.clone()),
            None => return,
        };

        if let Some(parent) = parent {
            if let Some(parent_node) = self.node_mut(parent) {
                if let Some(old) = &old_short {
                    parent_node.shortname_children.remove(old);
                }
                if let Some(new) = &new_short {
                    parent_node.shortname_children.insert(new.clone(), id);
                }
            }
        }
        if let Some(node) = self.node_mut(id) {
            node.short_name = new_short;
        }
    }

    /// Destroys a node and its whole subtree, detaching everything from the
    /// indexes. Returns cleanup info for each removed node so the caller
    /// can cancel transfers and delete state rows. The root is never
    /// destroyed.
    pub fn destroy(&mut self, id: NodeId) -> Vec<RemovedNode> {
        if id == self.root || !self.contains(id) {
            return Vec::new();
        }
        self.detach_from_parent(id);

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else {
                continue;
            };
            stack.extend(node.children.values().copied());

            let node = self.free_slot(current);
            if let Some(fsid) = node.fsid {
                Self::index_remove(&mut self.fsid_index, fsid, current);
            }
            if let Some(handle) = node.synced_handle {
                Self::index_remove(&mut self.handle_index, handle, current);
            }
            removed.push(RemovedNode {
                db_id: node.db_id,
                synced_handle: node.synced_handle,
                transfer: node.transfer,
            });
        }
        debug!(count = removed.len(), "destroyed subtree");
        removed
    }

    // ------------------------------------------------------------------
    // Indexed fields
    // ------------------------------------------------------------------

    pub fn set_fsid(&mut self, id: NodeId, fsid: Option<Fsid>) {
        let old = match self.node(id) {
            Some(n) => n.fsid,
            None => return,
        };
        if old == fsid {
            return;
        }
        if let Some(old) = old {
            Self::index_remove(&mut self.fsid_index, old, id);
        }
        if let Some(new) = fsid {
            self.fsid_index.entry(new).or_default().push(id);
        }
        self.node_mut(id).expect("live node").fsid = fsid;
    }

    pub fn set_synced_handle(&mut self, id: NodeId, handle: Option<NodeHandle>) {
        let old = match self.node(id) {
            Some(n) => n.synced_handle,
            None => return,
        };
        if old == handle {
            return;
        }
        if let Some(old) = old {
            Self::index_remove(&mut self.handle_index, old, id);
        }
        if let Some(new) = handle {
            self.handle_index.entry(new).or_default().push(id);
        }
        self.node_mut(id).expect("live node").synced_handle = handle;
    }

    /// Nodes currently carrying `fsid`. More than one entry means an inode
    /// was reused while its old owner is still being torn down.
    pub fn nodes_by_fsid(&self, fsid: Fsid) -> &[NodeId] {
        self.fsid_index.get(&fsid).map_or(&[], Vec::as_slice)
    }

    /// Nodes currently synced to `handle`.
    pub fn nodes_by_handle(&self, handle: NodeHandle) -> &[NodeId] {
        self.handle_index.get(&handle).map_or(&[], Vec::as_slice)
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Requests a reconciliation pass at `id` (`here`) or over its whole
    /// subtree (`below`), and tells every ancestor a descendant needs
    /// attention.
    pub fn set_future_sync(&mut self, id: NodeId, here: bool, below: bool) {
        self.raise_flag(id, here, below, FlagField::SyncAgain);
    }

    /// Requests a directory scan at `id` or over its whole subtree.
    pub fn set_future_scan(&mut self, id: NodeId, here: bool, below: bool) {
        self.raise_flag(id, here, below, FlagField::ScanAgain);
    }

    /// Marks a row blocked on a failed filesystem operation; arms (or
    /// doubles) its retry timer.
    pub fn set_use_blocked(&mut self, id: NodeId) {
        let Some(node) = self.node_mut(id) else { return };
        if node.flags.use_blocked.needs_action() {
            if let Some(timer) = node.rare().use_blocked_timer.as_mut() {
                timer.bump();
            }
        } else {
            node.flags.use_blocked = TreeState::ActionHere;
            node.rare().use_blocked_timer = Some(BackoffTimer::new());
        }
        self.flag_ancestors(id, FlagField::UseBlocked);
    }

    /// Marks a row that a scan could not interrogate; arms (or doubles) the
    /// timer that will eventually trigger a parent rescan.
    pub fn set_scan_blocked(&mut self, id: NodeId) {
        let Some(node) = self.node_mut(id) else { return };
        if node.flags.scan_blocked.needs_action() {
            if let Some(timer) = node.rare().scan_blocked_timer.as_mut() {
                timer.bump();
            }
        } else {
            node.flags.scan_blocked = TreeState::ActionHere;
            node.rare().scan_blocked_timer = Some(BackoffTimer::new());
        }
        self.flag_ancestors(id, FlagField::ScanBlocked);
    }

    /// Records a detected conflict at `id` and lets ancestors know.
    pub fn note_conflict(&mut self, id: NodeId) {
        if let Some(node) = self.node_mut(id) {
            if node.flags.conflicts < TreeState::ActionHere {
                node.flags.conflicts = TreeState::ActionHere;
            }
        }
        self.flag_ancestors(id, FlagField::Conflicts);
    }

    /// Pushes a subtree-wide scan/sync request one level down onto `child`.
    pub fn inherit_subtree_flags(&mut self, parent: NodeId, child: NodeId) {
        let (parent_scan, parent_sync) = match self.node(parent) {
            Some(p) => (p.flags.scan_again, p.flags.sync_again),
            None => return,
        };
        if let Some(child_node) = self.node_mut(child) {
            if !child_node.node_type.is_file() {
                child_node.flags.scan_again =
                    propagate_subtree(parent_scan, child_node.flags.scan_again);
                child_node.flags.sync_again =
                    propagate_subtree(parent_sync, child_node.flags.sync_again);
            }
        }
    }

    /// Recomputes a parent's aggregate flags from one child after a pass.
    /// While the parent holds an unresolved conflict its own scan/sync
    /// flags are left alone, so the level stays pending.
    pub fn aggregate_from_child(&mut self, parent: NodeId, child: NodeId) {
        let child_flags = match self.node(child) {
            Some(c) if !c.node_type.is_file() => c.flags,
            _ => return,
        };
        if let Some(parent_node) = self.node_mut(parent) {
            if !parent_node.flags.conflicts.needs_action() {
                parent_node.flags.scan_again =
                    update_from_child(parent_node.flags.scan_again, child_flags.scan_again);
                parent_node.flags.sync_again =
                    update_from_child(parent_node.flags.sync_again, child_flags.sync_again);
            }
            parent_node.flags.conflicts =
                update_from_child(parent_node.flags.conflicts, child_flags.conflicts);
        }
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// Absolute path of a node, rebuilt from its ancestry.
    pub fn path_of(&self, id: NodeId) -> PathBuf {
        let mut components = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let Some(node) = self.node(c) else { break };
            components.push(node.name.clone());
            current = node.parent;
        }
        let mut path = PathBuf::new();
        for component in components.iter().rev() {
            path.push(component);
        }
        path
    }

    /// Resolves `path` (absolute, under the root) to the deepest known
    /// node. Returns that node and whether any path components were left
    /// unmatched below it.
    pub fn node_by_path(&self, path: &Path) -> Option<(NodeId, bool)> {
        let root_path = PathBuf::from(&self.node(self.root)?.name);
        let relative = path.strip_prefix(&root_path).ok()?;

        let mut current = self.root;
        let mut remainder = false;
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            let node = self.node(current)?;
            match node.child(&name).or_else(|| node.shortname_child(&name)) {
                Some(child) => current = child,
                None => {
                    remainder = true;
                    break;
                }
            }
        }
        Some((current, remainder))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert_slot(&mut self, node: SyncNode) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn free_slot(&mut self, id: NodeId) -> SyncNode {
        let slot = &mut self.slots[id.index as usize];
        let node = slot.node.take().expect("freeing live slot");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        node
    }

    fn detach_from_parent(&mut self, id: NodeId) {
        let (parent, name, short_name) = match self.node(id) {
            Some(n) => (n.parent, n.name.clone(), n.short_name.clone()),
            None => return,
        };
        if let Some(parent) = parent {
            if let Some(parent_node) = self.node_mut(parent) {
                parent_node.children.remove(&name);
                if let Some(short) = short_name {
                    parent_node.shortname_children.remove(&short);
                }
            }
        }
    }

    fn index_remove<K: std::hash::Hash + Eq>(
        index: &mut HashMap<K, Vec<NodeId>>,
        key: K,
        id: NodeId,
    ) {
        if let Some(ids) = index.get_mut(&key) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                index.remove(&key);
            }
        }
    }

    fn raise_flag(&mut self, id: NodeId, here: bool, below: bool, field: FlagField) {
        if !(here || below) {
            return;
        }
        let target = if below {
            TreeState::ActionSubtree
        } else {
            TreeState::ActionHere
        };
        if let Some(node) = self.node_mut(id) {
            let flag = field.get_mut(&mut node.flags);
            *flag = (*flag).max(target);
        }
        self.flag_ancestors(id, field);
    }

    fn flag_ancestors(&mut self, id: NodeId, field: FlagField) {
        let mut current = self.node(id).and_then(|n| n.parent);
        while let Some(ancestor) = current {
            let Some(node) = self.node_mut(ancestor) else {
                break;
            };
            let flag = field.get_mut(&mut node.flags);
            if *flag >= TreeState::DescendantFlagged {
                // Everything above is already at least flagged.
                break;
            }
            *flag = TreeState::DescendantFlagged;
            current = node.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SyncTree {
        SyncTree::new(Path::new("/sync/root"), NodeHandle(1))
    }

    #[test]
    fn test_root_setup() {
        let t = tree();
        let root = t.node(t.root()).unwrap();
        assert_eq!(root.name, "/sync/root");
        assert_eq!(root.synced_handle, Some(NodeHandle(1)));
        assert_eq!(t.nodes_by_handle(NodeHandle(1)), &[t.root()]);
    }

    #[test]
    fn test_add_child_and_lookup() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let b = t.add_child(a, "b.txt".into(), Some("B~1.TXT".into()), NodeType::File);

        assert_eq!(t.node(t.root()).unwrap().child("a"), Some(a));
        assert_eq!(t.node(a).unwrap().child("b.txt"), Some(b));
        assert_eq!(t.node(a).unwrap().shortname_child("B~1.TXT"), Some(b));
        assert_eq!(t.path_of(b), PathBuf::from("/sync/root/a/b.txt"));
    }

    #[test]
    fn test_fsid_index_detach_attach() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::File);

        t.set_fsid(a, Some(Fsid(7)));
        assert_eq!(t.nodes_by_fsid(Fsid(7)), &[a]);

        t.set_fsid(a, Some(Fsid(8)));
        assert!(t.nodes_by_fsid(Fsid(7)).is_empty());
        assert_eq!(t.nodes_by_fsid(Fsid(8)), &[a]);

        t.set_fsid(a, None);
        assert!(t.nodes_by_fsid(Fsid(8)).is_empty());
    }

    #[test]
    fn test_fsid_index_is_a_multimap() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::File);
        let b = t.add_child(t.root(), "b".into(), None, NodeType::File);

        t.set_fsid(a, Some(Fsid(7)));
        t.set_fsid(b, Some(Fsid(7)));
        assert_eq!(t.nodes_by_fsid(Fsid(7)).len(), 2);
    }

    #[test]
    fn test_handle_index_tracks_sync_state() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::File);
        t.set_synced_handle(a, Some(NodeHandle(42)));
        assert_eq!(t.nodes_by_handle(NodeHandle(42)), &[a]);

        t.set_synced_handle(a, None);
        assert!(t.nodes_by_handle(NodeHandle(42)).is_empty());
    }

    #[test]
    fn test_set_parent_moves_node() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let b = t.add_child(t.root(), "b".into(), None, NodeType::Folder);
        let f = t.add_child(a, "f.txt".into(), None, NodeType::File);

        t.set_parent(f, b, "renamed.txt".into(), None);

        assert!(t.node(a).unwrap().child("f.txt").is_none());
        assert_eq!(t.node(b).unwrap().child("renamed.txt"), Some(f));
        assert_eq!(t.node(f).unwrap().parent, Some(b));
        assert_eq!(t.path_of(f), PathBuf::from("/sync/root/b/renamed.txt"));
    }

    #[test]
    fn test_destroy_removes_subtree_and_indexes() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let f = t.add_child(a, "f.txt".into(), None, NodeType::File);
        t.set_fsid(f, Some(Fsid(9)));
        t.set_synced_handle(f, Some(NodeHandle(9)));
        t.node_mut(f).unwrap().db_id = Some(12);

        let removed = t.destroy(a);
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().any(|r| r.db_id == Some(12)));
        assert!(!t.contains(a));
        assert!(!t.contains(f));
        assert!(t.nodes_by_fsid(Fsid(9)).is_empty());
        assert!(t.nodes_by_handle(NodeHandle(9)).is_empty());
        assert!(t.node(t.root()).unwrap().child("a").is_none());
    }

    #[test]
    fn test_stale_id_does_not_resolve_after_reuse() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::File);
        t.destroy(a);
        let b = t.add_child(t.root(), "b".into(), None, NodeType::File);

        // The new node reuses the slot but the old id stays dead.
        assert!(t.node(a).is_none());
        assert!(t.node(b).is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn test_future_scan_flags_ancestors() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let b = t.add_child(a, "b".into(), None, NodeType::Folder);

        t.set_future_scan(b, true, false);

        assert_eq!(t.node(b).unwrap().flags.scan_again, TreeState::ActionHere);
        assert_eq!(
            t.node(a).unwrap().flags.scan_again,
            TreeState::DescendantFlagged
        );
        assert_eq!(
            t.node(t.root()).unwrap().flags.scan_again,
            TreeState::DescendantFlagged
        );
    }

    #[test]
    fn test_future_scan_below_raises_to_subtree() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        t.set_future_scan(a, true, true);
        assert_eq!(t.node(a).unwrap().flags.scan_again, TreeState::ActionSubtree);
    }

    #[test]
    fn test_flag_raising_never_downgrades() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        t.set_future_sync(a, true, true);
        t.set_future_sync(a, true, false);
        assert_eq!(t.node(a).unwrap().flags.sync_again, TreeState::ActionSubtree);
    }

    #[test]
    fn test_inherit_subtree_flags() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let f = t.add_child(t.root(), "f.txt".into(), None, NodeType::File);
        t.set_future_scan(t.root(), true, true);

        t.inherit_subtree_flags(t.root(), a);
        t.inherit_subtree_flags(t.root(), f);

        assert_eq!(t.node(a).unwrap().flags.scan_again, TreeState::ActionSubtree);
        // Files do not hold scan flags.
        assert_eq!(t.node(f).unwrap().flags.scan_again, TreeState::Resolved);
    }

    #[test]
    fn test_aggregate_from_child() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        t.node_mut(a).unwrap().flags.scan_again = TreeState::ActionHere;
        t.node_mut(t.root()).unwrap().flags.scan_again = TreeState::Resolved;

        t.aggregate_from_child(t.root(), a);
        assert_eq!(
            t.node(t.root()).unwrap().flags.scan_again,
            TreeState::DescendantFlagged
        );
    }

    #[test]
    fn test_use_blocked_arms_timer() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::File);
        t.set_use_blocked(a);

        let node = t.node(a).unwrap();
        assert_eq!(node.flags.use_blocked, TreeState::ActionHere);
        assert!(node.rare_ref().unwrap().use_blocked_timer.is_some());
        assert_eq!(
            t.node(t.root()).unwrap().flags.use_blocked,
            TreeState::DescendantFlagged
        );
    }

    #[test]
    fn test_node_by_path() {
        let mut t = tree();
        let a = t.add_child(t.root(), "a".into(), None, NodeType::Folder);
        let b = t.add_child(a, "b".into(), None, NodeType::Folder);

        let (id, remainder) = t.node_by_path(Path::new("/sync/root/a/b")).unwrap();
        assert_eq!(id, b);
        assert!(!remainder);

        let (id, remainder) = t.node_by_path(Path::new("/sync/root/a/b/new/deep")).unwrap();
        assert_eq!(id, b);
        assert!(remainder);

        assert!(t.node_by_path(Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn test_update_shortname_reindexes() {
        let mut t = tree();
        let f = t.add_child(t.root(), "longname.txt".into(), Some("LONGNA~1.TXT".into()), NodeType::File);

        t.update_shortname(f, Some("LONGNA~2.TXT".into()));

        let root = t.node(t.root()).unwrap();
        assert!(root.shortname_child("LONGNA~1.TXT").is_none());
        assert_eq!(root.shortname_child("LONGNA~2.TXT"), Some(f));
    }

    #[test]
    fn test_known_fs_details_requires_fsid() {
        let mut t = tree();
        let f = t.add_child(t.root(), "f.txt".into(), None, NodeType::File);
        assert!(t.node(f).unwrap().known_fs_details().is_none());

        t.set_fsid(f, Some(Fsid(3)));
        t.node_mut(f).unwrap().fingerprint = Some(FileFingerprint {
            size: 10,
            mtime: 99,
            crc: 5,
        });

        let details = t.node(f).unwrap().known_fs_details().unwrap();
        assert_eq!(details.fsid, Some(Fsid(3)));
        assert_eq!(details.size, 10);
        assert_eq!(details.mtime, 99);
    }
}
