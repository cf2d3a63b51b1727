//! Advisory lock on a data directory
//!
//! One writable instance per directory. The lock file is created
//! exclusively and holds the owner's pid and start time so an operator can
//! tell a live owner from a stale file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};
use crate::observability::Logger;

pub const LOCK_FILE_NAME: &str = "xmlstore.lck";

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    released: bool,
}

impl DataDirLock {
    /// Take the lock, failing with `Locking` if another owner holds it.
    pub fn acquire(data_dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILE_NAME);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::read_owner(data_dir)
                    .map(|o| format!("pid {} since {}", o.pid, o.started_at.to_rfc3339()))
                    .unwrap_or_else(|| "unknown owner".to_string());
                return Err(StorageError::locking(format!(
                    "data directory {} is locked by {} ({})",
                    data_dir.display(),
                    holder,
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let owner = LockOwner {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        file.write_all(serde_json::to_string(&owner)?.as_bytes())?;
        file.sync_all()?;

        Ok(Self { path, released: false })
    }

    /// Owner recorded in `data_dir`, if a readable lock file exists.
    pub fn read_owner(data_dir: &Path) -> Option<LockOwner> {
        let content = fs::read_to_string(data_dir.join(LOCK_FILE_NAME)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> StorageResult<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != ErrorKind::NotFound {
                    Logger::warn(
                        "DATA_LOCK_RELEASE_FAILED",
                        &[("path", &self.path.display().to_string()), ("error", &e.to_string())],
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_refused() {
        let temp = TempDir::new().unwrap();
        let lock = DataDirLock::acquire(temp.path()).unwrap();

        let err = DataDirLock::acquire(temp.path()).unwrap_err();
        assert!(matches!(err, StorageError::Locking(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        lock.release().unwrap();
        assert!(!temp.path().join(LOCK_FILE_NAME).exists());
        DataDirLock::acquire(temp.path()).unwrap();
    }

    #[test]
    fn test_owner_recorded() {
        let temp = TempDir::new().unwrap();
        let _lock = DataDirLock::acquire(temp.path()).unwrap();

        let owner = DataDirLock::read_owner(temp.path()).unwrap();
        assert_eq!(owner.pid, std::process::id());
    }

    #[test]
    fn test_drop_removes_file() {
        let temp = TempDir::new().unwrap();
        {
            let _lock = DataDirLock::acquire(temp.path()).unwrap();
            assert!(temp.path().join(LOCK_FILE_NAME).exists());
        }
        assert!(!temp.path().join(LOCK_FILE_NAME).exists());
    }
}
