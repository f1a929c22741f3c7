//! Core configuration
//!
//! JSON file stored next to the database. Missing files and missing fields
//! fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{DomainError, DomainResult};
use crate::repository::MigrationPolicy;
use crate::sync::DeviceId;

pub const CONFIG_FILE_NAME: &str = "trivit_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Messages held while the companion is unreachable
    pub outbound_capacity: usize,
    /// Out-of-order messages buffered before giving up and resyncing
    pub reorder_window: usize,
    pub gap_timeout_ms: u64,
    /// Wait for a full snapshot after a resync request
    pub resync_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub rename_threshold: usize,
    pub max_delta_records: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            reorder_window: 32,
            gap_timeout_ms: 2_000,
            resync_timeout_ms: 10_000,
            tick_interval_ms: 250,
            rename_threshold: 1,
            max_delta_records: 8,
        }
    }
}

impl SyncSettings {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub device_id: DeviceId,
    pub database_file: String,
    pub migration_policy: MigrationPolicy,
    pub sync: SyncSettings,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::generate(),
            database_file: "trivit.db".to_string(),
            migration_policy: MigrationPolicy::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl CoreConfig {
    pub fn config_path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE_NAME)
    }

    pub fn database_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.database_file)
    }

    /// Read the config in `dir`, or defaults if there is none yet.
    pub fn load_or_default(dir: &Path) -> DomainResult<Self> {
        let path = Self::config_path(dir);
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(&path)
            .map_err(|e| DomainError::InvalidInput(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| DomainError::InvalidInput(format!("Invalid config {}: {}", path.display(), e)))
    }

    pub fn save(&self, dir: &Path) -> DomainResult<()> {
        std::fs::create_dir_all(dir)
            .map_err(|e| DomainError::InvalidInput(format!("Failed to create {}: {}", dir.display(), e)))?;
        let json = serde_json::to_string_pretty(self).map_err(|e| DomainError::InvalidInput(e.to_string()))?;
        let path = Self::config_path(dir);
        std::fs::write(&path, json)
            .map_err(|e| DomainError::InvalidInput(format!("Failed to write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.migration_policy, MigrationPolicy::AbortPreservingStore);
    }

    #[test]
    fn test_save_then_load_keeps_device_id() {
        let dir = tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.sync.outbound_capacity = 4;
        config.migration_policy = MigrationPolicy::RebuildEmpty;
        config.save(dir.path()).unwrap();

        let loaded = CoreConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            CoreConfig::config_path(dir.path()),
            r#"{"sync": {"resync_timeout_ms": 500}, "migration_policy": "rebuild_empty"}"#,
        )
        .unwrap();

        let config = CoreConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.sync.resync_timeout(), Duration::from_millis(500));
        assert_eq!(config.sync.outbound_capacity, 64);
        assert_eq!(config.migration_policy, MigrationPolicy::RebuildEmpty);
        assert_eq!(config.database_file, "trivit.db");
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(CoreConfig::config_path(dir.path()), "{ nope").unwrap();
        assert!(matches!(
            CoreConfig::load_or_default(dir.path()),
            Err(DomainError::InvalidInput(_))
        ));
    }
}
