//! Database instance configuration
//!
//! Loaded from a JSON file. Only `data_dir` is required; every other field
//! has a default. `validate()` rejects configurations the pool cannot honour.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};
use crate::observability::Severity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Data directory (required)
    pub data_dir: PathBuf,

    /// Brokers created eagerly when the pool starts
    #[serde(default = "default_min_brokers")]
    pub min_brokers: usize,

    /// Upper bound on concurrently live brokers
    #[serde(default = "default_max_brokers")]
    pub max_brokers: usize,

    /// Element nodes up to this tree level are keyed in the node btree
    #[serde(default = "default_index_depth")]
    pub index_depth: u32,

    #[serde(default = "default_max_shutdown_wait_ms")]
    pub max_shutdown_wait_ms: u64,

    /// None: a saturated pool blocks indefinitely
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_major_sync_period_ms")]
    pub major_sync_period_ms: u64,

    /// 0 disables the maintenance scheduler
    #[serde(default = "default_sync_period_ms")]
    pub sync_period_ms: u64,

    #[serde(default = "default_reserved_memory")]
    pub reserved_memory_bytes: u64,

    #[serde(default)]
    pub read_only: bool,

    /// Journal transactions and binary renames
    #[serde(default = "default_true")]
    pub transactional: bool,

    /// String index keys are lowercased when false
    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_min_brokers() -> usize {
    1
}
fn default_max_brokers() -> usize {
    15
}
fn default_index_depth() -> u32 {
    1
}
fn default_max_shutdown_wait_ms() -> u64 {
    45_000
}
fn default_lock_timeout_ms() -> u64 {
    30_000
}
fn default_major_sync_period_ms() -> u64 {
    300_000
}
fn default_sync_period_ms() -> u64 {
    120_000
}
fn default_reserved_memory() -> u64 {
    16 * 1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl DatabaseConfig {
    /// Defaults for a data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            min_brokers: default_min_brokers(),
            max_brokers: default_max_brokers(),
            index_depth: default_index_depth(),
            max_shutdown_wait_ms: default_max_shutdown_wait_ms(),
            acquire_timeout_ms: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            major_sync_period_ms: default_major_sync_period_ms(),
            sync_period_ms: default_sync_period_ms(),
            reserved_memory_bytes: default_reserved_memory(),
            read_only: false,
            transactional: true,
            case_sensitive: true,
            log_level: default_log_level(),
        }
    }

    pub fn load(path: &Path) -> StorageResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StorageError::invalid(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let config: DatabaseConfig = serde_json::from_str(&content)
            .map_err(|e| StorageError::invalid(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.min_brokers == 0 {
            return Err(StorageError::invalid("min_brokers must be >= 1"));
        }
        if self.max_brokers < self.min_brokers {
            return Err(StorageError::invalid(format!(
                "max_brokers ({}) must be >= min_brokers ({})",
                self.max_brokers, self.min_brokers
            )));
        }
        if self.index_depth == 0 {
            return Err(StorageError::invalid("index_depth must be >= 1"));
        }
        if self.log_severity().is_none() {
            return Err(StorageError::invalid(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn log_severity(&self) -> Option<Severity> {
        Severity::parse(&self.log_level)
    }

    pub fn max_shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.max_shutdown_wait_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sync_period(&self) -> Option<Duration> {
        if self.sync_period_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.sync_period_ms))
        }
    }

    pub fn major_sync_period(&self) -> Duration {
        Duration::from_millis(self.major_sync_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_json_gets_defaults() {
        let config: DatabaseConfig = serde_json::from_str(r#"{"data_dir": "/tmp/x"}"#).unwrap();
        assert_eq!(config.min_brokers, 1);
        assert_eq!(config.max_brokers, 15);
        assert_eq!(config.index_depth, 1);
        assert!(config.acquire_timeout().is_none());
        assert!(config.transactional);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_below_min_rejected() {
        let mut config = DatabaseConfig::new("/tmp/x");
        config.min_brokers = 4;
        config.max_brokers = 2;
        assert!(matches!(config.validate(), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let mut config = DatabaseConfig::new("/tmp/x");
        config.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_sync_period_disables_scheduler() {
        let mut config = DatabaseConfig::new("/tmp/x");
        config.sync_period_ms = 0;
        assert!(config.sync_period().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("xmlstore.json");
        let mut config = DatabaseConfig::new(temp.path().join("data"));
        config.max_brokers = 3;
        config.acquire_timeout_ms = Some(250);
        config.save(&path).unwrap();

        let loaded = DatabaseConfig::load(&path).unwrap();
        assert_eq!(loaded.max_brokers, 3);
        assert_eq!(loaded.acquire_timeout(), Some(Duration::from_millis(250)));
    }
}
