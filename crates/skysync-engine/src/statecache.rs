//! Persistence of the reconciled tree across restarts.
//!
//! The reconciler stages row inserts and deletions in memory and flushes
//! them inside one transaction per pass. Rows reference their parent by row
//! id, so inserts run parent-first: the flush loops over the staged set
//! until a pass makes no progress, deferring children whose parents have no
//! row id yet.
//!
//! On startup the whole table is read into a `parent id -> nodes` multimap
//! and the tree is rebuilt top-down, giving the reconciler the last synced
//! view to diff the first scans against.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use skysync_core::domain::{FileFingerprint, Fsid, NodeHandle, NodeType};
use skysync_core::ports::{IFileSystem, IStateStore, StoreError};

use crate::tree::{NodeId, SyncTree};

/// Maximum tree depth rebuilt from the cache.
const MAX_LOAD_DEPTH: u32 = 100;

/// One persisted row. The root is implicit (parent id 0) and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedNode {
    parent_db_id: u32,
    name: String,
    short_name: Option<String>,
    node_type: NodeType,
    fsid: Option<Fsid>,
    synced_handle: Option<NodeHandle>,
    fingerprint: Option<FileFingerprint>,
    /// False for rows written before shortnames were persisted; their
    /// shortname is refreshed from disk on load.
    #[serde(default)]
    short_name_recorded: bool,
}

/// Staging layer between the tree and the state store.
pub struct StateCache {
    store: Option<Box<dyn IStateStore>>,
    insertq: HashSet<NodeId>,
    deleteq: HashSet<u32>,
    next_id: u32,
}

impl StateCache {
    /// A cache over `store`, or an inert one when no persistence is
    /// configured.
    pub fn new(store: Option<Box<dyn IStateStore>>) -> Self {
        Self {
            store,
            insertq: HashSet::new(),
            deleteq: HashSet::new(),
            next_id: 1,
        }
    }

    /// Stages a node for (re)insertion.
    pub fn add(&mut self, id: NodeId, db_id: Option<u32>) {
        if let Some(db_id) = db_id {
            self.deleteq.remove(&db_id);
        }
        self.insertq.insert(id);
    }

    /// Stages a node's row for deletion.
    pub fn remove(&mut self, id: NodeId, db_id: Option<u32>) {
        self.insertq.remove(&id);
        if let Some(db_id) = db_id {
            self.deleteq.insert(db_id);
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.insertq.is_empty() || !self.deleteq.is_empty()
    }

    /// Writes all staged changes in one transaction.
    ///
    /// Nodes whose parent has no row id yet stay staged for the next flush;
    /// a store failure rolls the transaction back and leaves the staging
    /// queues as they were.
    pub fn flush(&mut self, tree: &mut SyncTree) -> Result<(), StoreError> {
        let Some(store) = self.store.as_mut() else {
            self.insertq.clear();
            self.deleteq.clear();
            return Ok(());
        };
        if self.insertq.is_empty() && self.deleteq.is_empty() {
            return Ok(());
        }
        debug!(
            inserts = self.insertq.len(),
            deletes = self.deleteq.len(),
            "flushing state cache"
        );

        let result = (|| -> Result<(), StoreError> {
            store.begin()?;

            for db_id in self.deleteq.iter() {
                store.del(*db_id)?;
            }
            self.deleteq.clear();

            // Parent-first insertion; loop until a pass adds nothing.
            let root = tree.root();
            loop {
                let mut progressed = false;
                let staged: Vec<NodeId> = self.insertq.iter().copied().collect();
                for id in staged {
                    let Some(node) = tree.node(id) else {
                        self.insertq.remove(&id);
                        continue;
                    };
                    if node.node_type == NodeType::Unknown {
                        // Never persist rows we could not interrogate.
                        self.insertq.remove(&id);
                        continue;
                    }
                    let Some(parent) = node.parent else {
                        self.insertq.remove(&id);
                        continue;
                    };
                    let parent_db_id = if parent == root {
                        Some(0)
                    } else {
                        tree.node(parent).and_then(|p| p.db_id)
                    };
                    let Some(parent_db_id) = parent_db_id else {
                        continue; // parent not written yet
                    };

                    let row = CachedNode {
                        parent_db_id,
                        name: node.name.clone(),
                        short_name: node.short_name.clone(),
                        node_type: node.node_type,
                        fsid: node.fsid,
                        synced_handle: node.synced_handle,
                        fingerprint: node.fingerprint,
                        short_name_recorded: true,
                    };
                    let payload = serde_json::to_vec(&row)
                        .map_err(|e| StoreError::Io(e.to_string()))?;

                    let db_id = match node.db_id {
                        Some(existing) => existing,
                        None => {
                            let fresh = self.next_id;
                            self.next_id += 1;
                            tree.node_mut(id).expect("checked live").db_id = Some(fresh);
                            fresh
                        }
                    };
                    store.put(db_id, &payload)?;
                    self.insertq.remove(&id);
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }

            store.commit()
        })();

        if let Err(err) = &result {
            warn!(error = %err, "state cache flush failed, rolling back");
            let _ = store.abort();
        } else if !self.insertq.is_empty() {
            warn!(left = self.insertq.len(), "state caching did not complete");
        }
        result
    }

    /// Rebuilds the tree from the store.
    ///
    /// Persisted fsids are only trusted when `fsids_stable`; shortnames
    /// missing from old rows are refreshed through the filesystem.
    pub fn load(
        &mut self,
        tree: &mut SyncTree,
        fs: &dyn IFileSystem,
        fsids_stable: bool,
    ) -> Result<usize, StoreError> {
        let Some(store) = self.store.as_mut() else {
            return Ok(0);
        };

        store.rewind()?;
        let mut by_parent: HashMap<u32, Vec<(u32, CachedNode)>> = HashMap::new();
        let mut count = 0usize;
        while let Some((db_id, payload)) = store.next()? {
            match serde_json::from_slice::<CachedNode>(&payload) {
                Ok(row) => {
                    by_parent.entry(row.parent_db_id).or_default().push((db_id, row));
                    self.next_id = self.next_id.max(db_id + 1);
                    count += 1;
                }
                Err(err) => {
                    warn!(db_id, error = %err, "dropping undecodable state row");
                }
            }
        }

        let root = tree.root();
        self.attach_children(tree, fs, fsids_stable, &by_parent, 0, root, MAX_LOAD_DEPTH);
        debug!(rows = count, "state cache loaded");
        Ok(count)
    }

    fn attach_children(
        &mut self,
        tree: &mut SyncTree,
        fs: &dyn IFileSystem,
        fsids_stable: bool,
        by_parent: &HashMap<u32, Vec<(u32, CachedNode)>>,
        parent_db_id: u32,
        parent: NodeId,
        depth_left: u32,
    ) {
        if depth_left == 0 {
            return;
        }
        let Some(rows) = by_parent.get(&parent_db_id) else {
            return;
        };
        for (db_id, row) in rows {
            let short_name = if row.short_name_recorded {
                row.short_name.clone()
            } else {
                // Old row format: look the shortname up on disk.
                let path = tree.path_of(parent).join(&row.name);
                fs.short_name(&path).filter(|s| *s != row.name)
            };

            let id = tree.add_child(parent, row.name.clone(), short_name, row.node_type);
            if fsids_stable {
                tree.set_fsid(id, row.fsid);
            }
            tree.set_synced_handle(id, row.synced_handle);
            let node = tree.node_mut(id).expect("just added");
            node.fingerprint = row.fingerprint;
            node.db_id = Some(*db_id);

            if !row.short_name_recorded {
                // Re-persist in the current format.
                self.add(id, Some(*db_id));
            }

            self.attach_children(
                tree,
                fs,
                fsids_stable,
                by_parent,
                *db_id,
                id,
                depth_left - 1,
            );
        }
    }

    /// Drops every persisted row; used when the sync is torn down.
    pub fn destroy_store(&mut self) {
        if let Some(store) = self.store.as_mut() {
            if let Err(err) = store.truncate() {
                warn!(error = %err, "failed to truncate state store");
            }
        }
        self.insertq.clear();
        self.deleteq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use skysync_cache::SqliteStore;

    use crate::fs_local::LocalFileSystem;

    fn store() -> Box<dyn IStateStore> {
        Box::new(SqliteStore::open_in_memory().unwrap())
    }

    fn fp(mtime: i64) -> FileFingerprint {
        FileFingerprint {
            size: 4,
            mtime,
            crc: 9,
        }
    }

    #[test]
    fn test_row_serialization_is_byte_stable() {
        let row = CachedNode {
            parent_db_id: 3,
            name: "a.txt".into(),
            short_name: Some("A~1.TXT".into()),
            node_type: NodeType::File,
            fsid: Some(Fsid(7)),
            synced_handle: Some(NodeHandle(9)),
            fingerprint: Some(fp(100)),
            short_name_recorded: true,
        };
        let bytes = serde_json::to_vec(&row).unwrap();
        let parsed: CachedNode = serde_json::from_slice(&bytes).unwrap();
        let again = serde_json::to_vec(&parsed).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(parsed, row);
    }

    #[test]
    fn test_flush_and_load_roundtrip() {
        let fs_impl = LocalFileSystem::new();
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let folder = tree.add_child(tree.root(), "docs".into(), None, NodeType::Folder);
        let file = tree.add_child(folder, "a.txt".into(), None, NodeType::File);
        tree.set_fsid(file, Some(Fsid(7)));
        tree.set_synced_handle(file, Some(NodeHandle(70)));
        tree.node_mut(file).unwrap().fingerprint = Some(fp(10));

        let mut cache = StateCache::new(Some(store()));
        // Stage child before parent; the flush must order them itself.
        cache.add(file, None);
        cache.add(folder, None);
        cache.flush(&mut tree).unwrap();
        assert!(!cache.has_pending_writes());

        // Move the store into a fresh cache and rebuild a fresh tree.
        let mut reloaded = StateCache::new(cache.store.take());
        let mut fresh = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let rows = reloaded.load(&mut fresh, &fs_impl, true).unwrap();
        assert_eq!(rows, 2);

        let folder = fresh.node(fresh.root()).unwrap().child("docs").unwrap();
        let file = fresh.node(folder).unwrap().child("a.txt").unwrap();
        let node = fresh.node(file).unwrap();
        assert_eq!(node.fsid, Some(Fsid(7)));
        assert_eq!(node.synced_handle, Some(NodeHandle(70)));
        assert_eq!(node.fingerprint, Some(fp(10)));
        assert_eq!(fresh.nodes_by_fsid(Fsid(7)), &[file]);
        assert_eq!(fresh.nodes_by_handle(NodeHandle(70)), &[file]);
    }

    #[test]
    fn test_unstable_fsids_are_dropped_on_load() {
        let fs_impl = LocalFileSystem::new();
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let file = tree.add_child(tree.root(), "a.txt".into(), None, NodeType::File);
        tree.set_fsid(file, Some(Fsid(7)));

        let mut cache = StateCache::new(Some(store()));
        cache.add(file, None);
        cache.flush(&mut tree).unwrap();

        let mut reloaded = StateCache::new(cache.store.take());
        let mut fresh = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        reloaded.load(&mut fresh, &fs_impl, false).unwrap();

        let file = fresh.node(fresh.root()).unwrap().child("a.txt").unwrap();
        assert_eq!(fresh.node(file).unwrap().fsid, None);
    }

    #[test]
    fn test_remove_deletes_row() {
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let file = tree.add_child(tree.root(), "a.txt".into(), None, NodeType::File);

        let mut cache = StateCache::new(Some(store()));
        cache.add(file, None);
        cache.flush(&mut tree).unwrap();
        let db_id = tree.node(file).unwrap().db_id;
        assert!(db_id.is_some());

        cache.remove(file, db_id);
        cache.flush(&mut tree).unwrap();

        let fs_impl = LocalFileSystem::new();
        let mut reloaded = StateCache::new(cache.store.take());
        let mut fresh = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        assert_eq!(reloaded.load(&mut fresh, &fs_impl, true).unwrap(), 0);
    }

    #[test]
    fn test_add_cancels_staged_delete() {
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let file = tree.add_child(tree.root(), "a.txt".into(), None, NodeType::File);

        let mut cache = StateCache::new(Some(store()));
        cache.add(file, None);
        cache.flush(&mut tree).unwrap();
        let db_id = tree.node(file).unwrap().db_id;

        cache.remove(file, db_id);
        cache.add(file, db_id);
        cache.flush(&mut tree).unwrap();

        let fs_impl = LocalFileSystem::new();
        let mut reloaded = StateCache::new(cache.store.take());
        let mut fresh = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        assert_eq!(reloaded.load(&mut fresh, &fs_impl, true).unwrap(), 1);
    }

    #[test]
    fn test_unknown_nodes_are_never_persisted() {
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let odd = tree.add_child(tree.root(), "odd".into(), None, NodeType::Unknown);

        let mut cache = StateCache::new(Some(store()));
        cache.add(odd, None);
        cache.flush(&mut tree).unwrap();

        let fs_impl = LocalFileSystem::new();
        let mut reloaded = StateCache::new(cache.store.take());
        let mut fresh = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        assert_eq!(reloaded.load(&mut fresh, &fs_impl, true).unwrap(), 0);
    }

    #[test]
    fn test_inert_cache_accepts_everything() {
        let mut tree = SyncTree::new(Path::new("/sync"), NodeHandle(1));
        let file = tree.add_child(tree.root(), "a.txt".into(), None, NodeType::File);

        let mut cache = StateCache::new(None);
        cache.add(file, None);
        cache.flush(&mut tree).unwrap();
        assert!(!cache.has_pending_writes());
    }
}
