//! Filesystem notifications.
//!
//! Wraps the `notify` crate and reduces its event taxonomy to the one thing
//! the reconciler wants: "something changed at this path". The engine maps
//! each path onto the deepest known tree node and flags it for rescanning;
//! the notification quiet time keeps a burst of events from triggering a
//! scan per keystroke.

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Watcher setup failures.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create filesystem watcher: {0}")]
    Create(notify::Error),

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

/// Recursive watcher feeding changed paths into a channel.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates the watcher and the channel its events arrive on.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        let watcher = RecommendedWatcher::new(
            move |result: Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    for path in paths_of_interest(&event) {
                        if tx.send(path).is_err() {
                            // Receiver gone; the sync is shutting down.
                            return;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "filesystem watcher error");
                }
            },
            notify::Config::default(),
        )
        .map_err(WatchError::Create)?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` and everything below it.
    pub fn watch(&mut self, path: &Path) -> Result<(), WatchError> {
        debug!(path = %path.display(), "starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Stops watching `path`.
    pub fn unwatch(&mut self, path: &Path) -> Result<(), WatchError> {
        debug!(path = %path.display(), "stopping watch");
        self.watcher
            .unwatch(path)
            .map_err(|source| WatchError::Watch {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Extracts the paths a raw event affects, dropping access noise.
///
/// Renames report both endpoints so the old and the new parent are each
/// rescanned.
fn paths_of_interest(event: &notify::Event) -> Vec<PathBuf> {
    match &event.kind {
        EventKind::Create(_) | EventKind::Remove(_) => event.paths.clone(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() < 2 {
                warn!(paths = event.paths.len(), "rename event with missing endpoint");
            }
            event.paths.clone()
        }

        EventKind::Modify(_) => event.paths.clone(),

        // Access events carry no sync-relevant change.
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: Vec<PathBuf>) -> notify::Event {
        notify::Event {
            kind,
            paths,
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_create_reports_path() {
        let e = event(
            EventKind::Create(notify::event::CreateKind::File),
            vec![PathBuf::from("/r/a.txt")],
        );
        assert_eq!(paths_of_interest(&e), vec![PathBuf::from("/r/a.txt")]);
    }

    #[test]
    fn test_modify_data_reports_path() {
        let e = event(
            EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
            vec![PathBuf::from("/r/a.txt")],
        );
        assert_eq!(paths_of_interest(&e), vec![PathBuf::from("/r/a.txt")]);
    }

    #[test]
    fn test_rename_reports_both_endpoints() {
        let e = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            vec![PathBuf::from("/r/old.txt"), PathBuf::from("/r/new.txt")],
        );
        assert_eq!(
            paths_of_interest(&e),
            vec![PathBuf::from("/r/old.txt"), PathBuf::from("/r/new.txt")]
        );
    }

    #[test]
    fn test_remove_reports_path() {
        let e = event(
            EventKind::Remove(notify::event::RemoveKind::File),
            vec![PathBuf::from("/r/gone.txt")],
        );
        assert_eq!(paths_of_interest(&e), vec![PathBuf::from("/r/gone.txt")]);
    }

    #[test]
    fn test_access_is_ignored() {
        let e = event(
            EventKind::Access(notify::event::AccessKind::Read),
            vec![PathBuf::from("/r/a.txt")],
        );
        assert!(paths_of_interest(&e).is_empty());
    }

    #[test]
    fn test_watch_real_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut watcher, _rx) = FileWatcher::new().unwrap();
        watcher.watch(dir.path()).unwrap();
        watcher.unwatch(dir.path()).unwrap();
    }
}
