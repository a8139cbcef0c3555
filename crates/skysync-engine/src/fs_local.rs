//! Local filesystem adapter.
//!
//! Implements the filesystem port over `std::fs`. On Unix the filesystem id
//! is the inode number and the volume fingerprint is the device id; both are
//! stable across remounts, so persisted fsids are trusted on reload.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;

use skysync_core::domain::{FileFingerprint, Fsid, NodeType};
use skysync_core::ports::{FileHandle, FsError, IFileSystem, NameCase, Stat};

/// Filesystem access through the standard library.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

struct LocalHandle {
    path: PathBuf,
    stat: Stat,
}

impl FileHandle for LocalHandle {
    fn stat(&self) -> &Stat {
        &self.stat
    }

    fn fingerprint(&mut self) -> Result<FileFingerprint, FsError> {
        if self.stat.node_type != NodeType::File {
            return Err(FsError::Permanent(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fingerprint of a non-file",
            )));
        }
        let mut file = fs::File::open(&self.path).map_err(FsError::from_io)?;
        FileFingerprint::from_reader(self.stat.size, self.stat.mtime, &mut file)
            .map_err(FsError::from_io)
    }
}

fn mtime_secs(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Some(d.as_secs() as i64),
            Err(e) => Some(-(e.duration().as_secs() as i64)),
        })
        .unwrap_or(0)
}

#[cfg(unix)]
fn entry_fsid(metadata: &fs::Metadata) -> Option<Fsid> {
    use std::os::unix::fs::MetadataExt;
    Some(Fsid(metadata.ino()))
}

#[cfg(not(unix))]
fn entry_fsid(_metadata: &fs::Metadata) -> Option<Fsid> {
    None
}

impl IFileSystem for LocalFileSystem {
    fn open(&self, path: &Path, follow_symlinks: bool) -> Result<Box<dyn FileHandle>, FsError> {
        let link_metadata = fs::symlink_metadata(path).map_err(FsError::from_io)?;
        let is_symlink = link_metadata.file_type().is_symlink();

        let metadata = if follow_symlinks && is_symlink {
            fs::metadata(path).map_err(FsError::from_io)?
        } else {
            link_metadata
        };

        let node_type = if metadata.is_dir() {
            NodeType::Folder
        } else if metadata.is_file() {
            NodeType::File
        } else {
            NodeType::Unknown
        };

        Ok(Box::new(LocalHandle {
            path: path.to_path_buf(),
            stat: Stat {
                node_type,
                size: metadata.len(),
                mtime: mtime_secs(&metadata),
                fsid: entry_fsid(&metadata),
                is_symlink,
            },
        }))
    }

    fn enumerate(&self, path: &Path) -> Result<Vec<String>, FsError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).map_err(FsError::from_io)? {
            let entry = entry.map_err(FsError::from_io)?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    debug!(name = ?raw, "skipping entry with undecodable name");
                }
            }
        }
        Ok(names)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        fs::rename(from, to).map_err(FsError::from_io)
    }

    fn mkdir(&self, path: &Path, recursive: bool) -> Result<(), FsError> {
        let result = if recursive {
            fs::create_dir_all(path)
        } else {
            fs::create_dir(path)
        };
        result.map_err(FsError::from_io)
    }

    fn short_name(&self, _path: &Path) -> Option<String> {
        // No legacy secondary names on the filesystems this adapter serves.
        None
    }

    #[cfg(unix)]
    fn volume_fingerprint(&self, path: &Path) -> Option<u64> {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path).ok().map(|m| m.dev())
    }

    #[cfg(not(unix))]
    fn volume_fingerprint(&self, _path: &Path) -> Option<u64> {
        None
    }

    fn fsids_stable(&self) -> bool {
        cfg!(unix)
    }

    fn name_case(&self, _root: &Path) -> NameCase {
        if cfg!(any(target_os = "windows", target_os = "macos")) {
            NameCase::Insensitive
        } else {
            NameCase::Sensitive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"content").unwrap();

        let fs_impl = LocalFileSystem::new();
        let handle = fs_impl.open(&path, true).unwrap();
        let stat = handle.stat();
        assert_eq!(stat.node_type, NodeType::File);
        assert_eq!(stat.size, 7);
        assert!(stat.mtime > 0);
        assert!(!stat.is_symlink);
        #[cfg(unix)]
        assert!(stat.fsid.is_some());
    }

    #[test]
    fn test_open_missing_is_permanent() {
        let dir = TempDir::new().unwrap();
        let fs_impl = LocalFileSystem::new();
        let err = match fs_impl.open(&dir.path().join("missing"), true) {
            Ok(_) => panic!("expected open to fail for missing path"),
            Err(e) => e,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_fingerprint_matches_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"fingerprint me").unwrap();

        let fs_impl = LocalFileSystem::new();
        let mut handle = fs_impl.open(&path, true).unwrap();
        let fp = handle.fingerprint().unwrap();
        assert_eq!(fp.size, 14);
        assert_eq!(fp.crc, crc32fast::hash(b"fingerprint me"));
    }

    #[test]
    fn test_fingerprint_of_directory_fails() {
        let dir = TempDir::new().unwrap();
        let fs_impl = LocalFileSystem::new();
        let mut handle = fs_impl.open(dir.path(), true).unwrap();
        assert!(handle.fingerprint().is_err());
    }

    #[test]
    fn test_enumerate() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();

        let fs_impl = LocalFileSystem::new();
        let mut names = fs_impl.enumerate(dir.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_rename_and_mkdir() {
        let dir = TempDir::new().unwrap();
        let fs_impl = LocalFileSystem::new();

        fs_impl.mkdir(&dir.path().join("sub"), false).unwrap();
        fs_impl
            .mkdir(&dir.path().join("deep/nested/dir"), true)
            .unwrap();

        fs::write(dir.path().join("sub/f.txt"), b"x").unwrap();
        fs_impl
            .rename(&dir.path().join("sub/f.txt"), &dir.path().join("f.txt"))
            .unwrap();
        assert!(dir.path().join("f.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_not_followed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("target"), b"t").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("link")).unwrap();

        let fs_impl = LocalFileSystem::new();
        let handle = fs_impl.open(&dir.path().join("link"), false).unwrap();
        assert!(handle.stat().is_symlink);
    }

    #[test]
    fn test_volume_fingerprint_consistent_within_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();

        let fs_impl = LocalFileSystem::new();
        #[cfg(unix)]
        assert_eq!(
            fs_impl.volume_fingerprint(dir.path()),
            fs_impl.volume_fingerprint(&dir.path().join("a"))
        );
    }
}
