//! Off-thread directory scanning.
//!
//! The reconciler never enumerates directories itself; it queues a
//! [`ScanRequest`] and keeps walking. One or more worker threads drain a
//! FIFO, interrogate each directory entry once, and publish the results.
//! Completion is observed through `completed()` (release/acquire ordered
//! against the result write), and a weak cookie wakes the requester's run
//! loop; if the requester is gone the results are silently dropped.
//!
//! Workers reuse a prior fingerprint for entries whose name, type, fsid,
//! mtime and size all still match, so a folder full of untouched files
//! rescans without re-reading a byte.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

use skysync_core::domain::{FsNode, NodeType};
use skysync_core::ports::IFileSystem;

use crate::tree::NodeId;

/// Wakes the requester's run loop when a scan finishes.
///
/// Requests hold this weakly: a scan completing after its sync died just
/// discards its results.
pub struct ScanCookie {
    notify: Notify,
}

impl ScanCookie {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
        })
    }

    /// Resolves once a scan completes after this call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn complete(&self) {
        self.notify.notify_one();
    }
}

struct RequestInner {
    complete: AtomicBool,
    target: NodeId,
    path: PathBuf,
    /// Prior child details for fingerprint reuse; consumed by the worker.
    known: Mutex<HashMap<String, FsNode>>,
    results: Mutex<Vec<FsNode>>,
    cookie: Weak<ScanCookie>,
}

/// Handle to one queued directory scan.
#[derive(Clone)]
pub struct ScanRequest {
    inner: Arc<RequestInner>,
}

impl ScanRequest {
    /// Whether the scan has finished. Once true, `results()` returns the
    /// full listing; the release store in the worker pairs with this
    /// acquire load.
    pub fn completed(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Whether this request targets the given tree node.
    pub fn matches(&self, node: NodeId) -> bool {
        self.inner.target == node
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Takes the scan results. Only meaningful after `completed()`.
    pub fn results(&self) -> Vec<FsNode> {
        std::mem::take(&mut self.inner.results.lock())
    }
}

struct WorkerState {
    fs: Arc<dyn IFileSystem>,
    /// FIFO of requests; `None` is the termination sentinel and is left in
    /// place so every thread sees it.
    pending: Mutex<VecDeque<Option<Arc<RequestInner>>>>,
    notifier: Condvar,
    debris: PathBuf,
    follow_symlinks: bool,
}

/// The scan worker pool for one sync.
///
/// Dropping the service queues the termination sentinel and joins the
/// worker threads.
pub struct ScanService {
    state: Arc<WorkerState>,
    threads: Vec<JoinHandle<()>>,
    cookie: Arc<ScanCookie>,
}

impl ScanService {
    /// Starts `num_threads` workers (at least one) scanning through `fs`.
    /// Anything under `debris` is never scanned.
    pub fn new(fs: Arc<dyn IFileSystem>, debris: PathBuf, num_threads: usize) -> Self {
        let state = Arc::new(WorkerState {
            fs,
            pending: Mutex::new(VecDeque::new()),
            notifier: Condvar::new(),
            debris,
            follow_symlinks: false,
        });

        let num_threads = num_threads.max(1);
        debug!(num_threads, "starting scan workers");
        let threads = (0..num_threads)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || worker_loop(state))
            })
            .collect();

        Self {
            state,
            threads,
            cookie: ScanCookie::new(),
        }
    }

    /// The cookie a run loop can await for scan completions.
    pub fn cookie(&self) -> Arc<ScanCookie> {
        Arc::clone(&self.cookie)
    }

    /// Queues a scan of `path` on behalf of tree node `target`.
    ///
    /// `known` carries the previously-recorded child entries whose
    /// fingerprints may be reused. A request for a path inside the debris
    /// folder completes immediately with no results.
    pub fn scan(
        &self,
        target: NodeId,
        path: PathBuf,
        known: HashMap<String, FsNode>,
    ) -> ScanRequest {
        let in_debris = path.starts_with(&self.state.debris);

        let inner = Arc::new(RequestInner {
            complete: AtomicBool::new(in_debris),
            target,
            path,
            known: Mutex::new(known),
            results: Mutex::new(Vec::new()),
            cookie: Arc::downgrade(&self.cookie),
        });

        if in_debris {
            debug!("not scanning the debris folder");
        } else {
            debug!(path = %inner.path.display(), "queuing scan");
            self.state.pending.lock().push_back(Some(Arc::clone(&inner)));
            self.state.notifier.notify_one();
        }

        ScanRequest { inner }
    }
}

impl Drop for ScanService {
    fn drop(&mut self) {
        self.state.pending.lock().push_back(None);
        self.state.notifier.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        debug!("scan workers stopped");
    }
}

fn worker_loop(state: Arc<WorkerState>) {
    loop {
        let request = {
            let mut pending = state.pending.lock();
            state.notifier.wait_while(&mut pending, |p| p.is_empty());

            // Termination sentinel: leave it queued for the other threads.
            if matches!(pending.front(), Some(None)) {
                return;
            }
            pending.pop_front().flatten().expect("non-sentinel entry")
        };

        debug!(path = %request.path.display(), "scanning directory");
        scan_directory(&state, &request);
        request.complete.store(true, Ordering::Release);

        match request.cookie.upgrade() {
            Some(cookie) => cookie.complete(),
            None => debug!("requester gone, discarding scan results"),
        }
    }
}

fn scan_directory(state: &WorkerState, request: &RequestInner) {
    let path = &request.path;
    if path.starts_with(&state.debris) {
        return;
    }

    // The target may have vanished or changed type since it was queued.
    let handle = match state.fs.open(path, true) {
        Ok(handle) => handle,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "scan target unreadable");
            return;
        }
    };
    if handle.stat().node_type != NodeType::Folder {
        debug!(path = %path.display(), "scan target is not a directory");
        return;
    }

    let names = match state.fs.enumerate(path) {
        Ok(names) => names,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "unable to iterate scan target");
            return;
        }
    };

    let known = std::mem::take(&mut *request.known.lock());
    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let child_path = path.join(&name);
        if child_path.starts_with(&state.debris) {
            continue;
        }
        results.push(interrogate(state, name, &child_path, &known));
    }

    *request.results.lock() = results;
}

/// Learns everything about one directory entry with a single open.
fn interrogate(
    state: &WorkerState,
    name: String,
    path: &Path,
    known: &HashMap<String, FsNode>,
) -> FsNode {
    let mut handle = match state.fs.open(path, state.follow_symlinks) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "error opening file");
            let mut node = FsNode::unknown(name);
            node.is_blocked = err.is_transient();
            return node;
        }
    };

    let stat = handle.stat().clone();
    let mut node = FsNode {
        short_name: state.fs.short_name(path).filter(|s| *s != name),
        name,
        node_type: stat.node_type,
        size: stat.size,
        mtime: stat.mtime,
        fsid: stat.fsid,
        is_symlink: stat.is_symlink,
        is_blocked: false,
        fingerprint: None,
    };

    if node.is_symlink {
        debug!(path = %path.display(), "interrogated path is a symlink");
    }

    // Folders carry no fingerprint.
    if node.node_type != NodeType::File {
        return node;
    }

    match known.get(&node.name) {
        Some(prior) if prior.fingerprint.is_some() && node.can_reuse_fingerprint_of(prior) => {
            node.fingerprint = prior.fingerprint;
        }
        _ => match handle.fingerprint() {
            Ok(fp) => node.fingerprint = Some(fp),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "error fingerprinting file");
                if err.is_transient() {
                    node.is_blocked = true;
                } else {
                    node.node_type = NodeType::Unknown;
                }
            }
        },
    }

    node
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use skysync_core::domain::{FileFingerprint, Fsid};

    use crate::fs_local::LocalFileSystem;
    use crate::tree::SyncTree;
    use skysync_core::domain::NodeHandle;

    fn service(dir: &TempDir) -> (ScanService, NodeId) {
        let fs: Arc<dyn IFileSystem> = Arc::new(LocalFileSystem::new());
        let tree = SyncTree::new(dir.path(), NodeHandle(1));
        (
            ScanService::new(fs, dir.path().join(".debris"), 1),
            tree.root(),
        )
    }

    fn wait_complete(request: &ScanRequest) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !request.completed() {
            assert!(Instant::now() < deadline, "scan did not complete in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_scan_lists_children_with_fingerprints() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let (service, root) = service(&dir);
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);

        let mut results = request.results();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].name, "a.txt");
        assert_eq!(results[0].node_type, NodeType::File);
        let fp = results[0].fingerprint.unwrap();
        assert_eq!(fp.size, 5);
        assert_eq!(fp.crc, crc32fast::hash(b"alpha"));

        assert_eq!(results[1].name, "sub");
        assert_eq!(results[1].node_type, NodeType::Folder);
        assert!(results[1].fingerprint.is_none());
    }

    #[test]
    fn test_fingerprint_reuse_skips_rereading() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let (service, root) = service(&dir);

        // First scan learns the real entry.
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);
        let first = request.results().pop().unwrap();

        // Second scan passes the entry back as known, with a marker crc.
        // If the worker reuses it, the marker survives.
        let mut known_node = first.clone();
        known_node.fingerprint = Some(FileFingerprint {
            crc: 0xdead_beef,
            ..known_node.fingerprint.unwrap()
        });
        let mut known = HashMap::new();
        known.insert(known_node.name.clone(), known_node);

        let request = service.scan(root, dir.path().to_path_buf(), known);
        wait_complete(&request);
        let second = request.results().pop().unwrap();
        assert_eq!(second.fingerprint.unwrap().crc, 0xdead_beef);
    }

    #[test]
    fn test_changed_file_gets_fresh_fingerprint() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let (service, root) = service(&dir);
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);
        let first = request.results().pop().unwrap();

        // Different size, so the known entry must not be reused.
        fs::write(dir.path().join("a.txt"), b"alpha beta").unwrap();
        let mut known = HashMap::new();
        known.insert(first.name.clone(), first);

        let request = service.scan(root, dir.path().to_path_buf(), known);
        wait_complete(&request);
        let second = request.results().pop().unwrap();
        assert_eq!(second.fingerprint.unwrap().crc, crc32fast::hash(b"alpha beta"));
    }

    #[test]
    fn test_debris_is_never_scanned() {
        let dir = TempDir::new().unwrap();
        let debris = dir.path().join(".debris");
        fs::create_dir(&debris).unwrap();
        fs::write(debris.join("old.txt"), b"junk").unwrap();
        fs::write(dir.path().join("live.txt"), b"live").unwrap();

        let (service, root) = service(&dir);

        // A scan of the root skips the debris entry.
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);
        let results = request.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "live.txt");

        // A scan of the debris itself completes empty without queuing.
        let request = service.scan(root, debris, HashMap::new());
        assert!(request.completed());
        assert!(request.results().is_empty());
    }

    #[test]
    fn test_missing_target_completes_empty() {
        let dir = TempDir::new().unwrap();
        let (service, root) = service(&dir);

        let request = service.scan(root, dir.path().join("nope"), HashMap::new());
        wait_complete(&request);
        assert!(request.results().is_empty());
    }

    #[test]
    fn test_matches_checks_target_identity() {
        let dir = TempDir::new().unwrap();
        let fs_impl: Arc<dyn IFileSystem> = Arc::new(LocalFileSystem::new());
        let mut tree = SyncTree::new(dir.path(), NodeHandle(1));
        let other = tree.add_child(tree.root(), "sub".into(), None, NodeType::Folder);
        let service = ScanService::new(fs_impl, dir.path().join(".debris"), 1);

        let request = service.scan(tree.root(), dir.path().to_path_buf(), HashMap::new());
        assert!(request.matches(tree.root()));
        assert!(!request.matches(other));
        wait_complete(&request);
    }

    #[tokio::test]
    async fn test_cookie_wakes_waiter() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let (service, root) = service(&dir);
        let cookie = service.cookie();
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());

        tokio::time::timeout(Duration::from_secs(5), cookie.notified())
            .await
            .expect("scan completion should wake the cookie");
        assert!(request.completed());
    }

    #[test]
    fn test_symlinks_are_flagged() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("target.txt"), b"t").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("target.txt"), dir.path().join("link.txt"))
            .unwrap();

        #[cfg(unix)]
        {
            let (service, root) = service(&dir);
            let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
            wait_complete(&request);
            let results = request.results();
            let link = results.iter().find(|n| n.name == "link.txt").unwrap();
            assert!(link.is_symlink);
        }
    }

    #[test]
    fn test_drop_joins_workers() {
        let dir = TempDir::new().unwrap();
        let (service, root) = service(&dir);
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);
        drop(service);
        // Reaching here without hanging is the assertion.
    }

    #[test]
    fn test_fsids_are_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let (service, root) = service(&dir);
        let request = service.scan(root, dir.path().to_path_buf(), HashMap::new());
        wait_complete(&request);
        let results = request.results();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let ino = fs::metadata(dir.path().join("a.txt")).unwrap().ino();
            assert_eq!(results[0].fsid, Some(Fsid(ino)));
        }
        #[cfg(not(unix))]
        {
            let _ = results;
        }
    }
}
