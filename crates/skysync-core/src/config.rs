//! Configuration types.
//!
//! [`SyncConfig`] describes one configured sync pair and is what the
//! per-process configuration table persists. [`EngineOptions`] collects the
//! engine tunables with production defaults; tests shrink the delays.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::NodeHandle;

/// One configured sync: a local root paired with a remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Stable integer tag identifying this sync across restarts.
    pub tag: u32,
    /// Absolute path of the local subtree.
    pub local_root: PathBuf,
    /// Handle of the remote folder this subtree mirrors.
    pub remote_root: NodeHandle,
    /// Name of the local quarantine folder, relative to `local_root`.
    #[serde(default = "default_debris_name")]
    pub debris_name: String,
    /// Volume fingerprint recorded when the sync was created. A mismatch at
    /// startup means the root moved to a different filesystem and persisted
    /// fsids cannot be trusted.
    #[serde(default)]
    pub volume_fingerprint: Option<u64>,
    /// Identifier of the owning user/session, part of the state table name.
    #[serde(default)]
    pub user_id: u64,
}

fn default_debris_name() -> String {
    ".debris".to_string()
}

impl SyncConfig {
    pub fn new(tag: u32, local_root: impl Into<PathBuf>, remote_root: NodeHandle) -> Self {
        Self {
            tag,
            local_root: local_root.into(),
            remote_root,
            debris_name: default_debris_name(),
            volume_fingerprint: None,
            user_id: 0,
        }
    }

    /// Absolute path of the local debris folder.
    pub fn debris_path(&self) -> PathBuf {
        self.local_root.join(&self.debris_name)
    }
}

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Number of scan worker threads.
    pub scan_workers: usize,
    /// Quiet time after a filesystem notification before the next pass
    /// scans the flagged directory.
    #[serde(with = "duration_millis")]
    pub scanning_delay: Duration,
    /// Quiet time for file events on network filesystems, where events can
    /// arrive long before the content settles.
    #[serde(with = "duration_millis")]
    pub extra_scanning_delay: Duration,
    /// Minimum interval between two scans of the same directory.
    #[serde(with = "duration_millis")]
    pub min_rescan_interval: Duration,
    /// A file modified more recently than this is considered still changing
    /// and its pending move is deferred.
    #[serde(with = "duration_millis")]
    pub file_update_delay: Duration,
    /// Hard ceiling on how long a move waits for a changing file to settle.
    #[serde(with = "duration_millis")]
    pub file_update_max_delay: Duration,
    /// Whether the sync root lives on a network filesystem.
    pub is_network: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            scan_workers: 1,
            scanning_delay: Duration::from_millis(500),
            extra_scanning_delay: Duration::from_secs(15),
            min_rescan_interval: Duration::from_secs(2),
            file_update_delay: Duration::from_secs(3),
            file_update_max_delay: Duration::from_secs(60),
            is_network: false,
        }
    }
}

impl EngineOptions {
    /// Loads options from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options = serde_yaml::from_str(&content)?;
        Ok(options)
    }

    /// Options with all delays zeroed, for tests that drive passes manually.
    pub fn immediate() -> Self {
        Self {
            scanning_delay: Duration::ZERO,
            extra_scanning_delay: Duration::ZERO,
            min_rescan_interval: Duration::ZERO,
            file_update_delay: Duration::ZERO,
            file_update_max_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sync_config_serde_roundtrip() {
        let config = SyncConfig::new(3, "/home/user/Drive", NodeHandle(0xabc));
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_debris_path_is_under_root() {
        let config = SyncConfig::new(1, "/data/sync", NodeHandle(1));
        assert_eq!(config.debris_path(), PathBuf::from("/data/sync/.debris"));
    }

    #[test]
    fn test_default_options_are_production_values() {
        let options = EngineOptions::default();
        assert_eq!(options.scanning_delay, Duration::from_millis(500));
        assert_eq!(options.min_rescan_interval, Duration::from_secs(2));
        assert_eq!(options.file_update_max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_yaml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(tmp, "scan_workers: 4\nmin_rescan_interval: 100").unwrap();

        let options = EngineOptions::load(tmp.path()).unwrap();
        assert_eq!(options.scan_workers, 4);
        assert_eq!(options.min_rescan_interval, Duration::from_millis(100));
        // Unspecified fields keep their defaults.
        assert_eq!(options.file_update_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_immediate_zeroes_delays() {
        let options = EngineOptions::immediate();
        assert_eq!(options.min_rescan_interval, Duration::ZERO);
        assert_eq!(options.scanning_delay, Duration::ZERO);
    }
}
