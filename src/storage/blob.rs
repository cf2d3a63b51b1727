//! Filesystem store for binary resources
//!
//! A binary document lives at `<data_dir>/fs/<collection path>/<name>`.
//! Removing a collection does not delete its directory: it is moved under
//! `<data_dir>/fs.journal/<uuid>/` so the removal can be undone by replaying
//! the journal.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{StorageError, StorageResult};

#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    backup_root: PathBuf,
}

/// Size and SHA-256 (hex) of stored content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
    pub digest: String,
}

pub fn digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

impl BlobStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("fs"),
            backup_root: data_dir.join("fs.journal"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/db/a/b` maps to `<root>/db/a/b`.
    pub fn collection_dir(&self, collection_path: &str) -> PathBuf {
        self.root.join(collection_path.trim_start_matches('/'))
    }

    pub fn file_path(&self, collection_path: &str, name: &str) -> PathBuf {
        self.collection_dir(collection_path).join(name)
    }

    pub fn write(&self, collection_path: &str, name: &str, data: &[u8]) -> StorageResult<BlobInfo> {
        let path = self.file_path(collection_path, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(BlobInfo {
            size: data.len() as u64,
            digest: digest(data),
        })
    }

    pub fn read(&self, collection_path: &str, name: &str) -> StorageResult<Vec<u8>> {
        let path = self.file_path(collection_path, name);
        fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StorageError::not_found(format!("binary content {}", path.display()))
            } else {
                StorageError::from(e)
            }
        })
    }

    /// Missing files are not an error.
    pub fn delete(&self, collection_path: &str, name: &str) -> StorageResult<bool> {
        match fs::remove_file(self.file_path(collection_path, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn rename_file(
        &self,
        from_collection: &str,
        from_name: &str,
        to_collection: &str,
        to_name: &str,
    ) -> StorageResult<()> {
        let to = self.file_path(to_collection, to_name);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.file_path(from_collection, from_name), to)?;
        Ok(())
    }

    /// Move a collection directory; false if it did not exist.
    pub fn rename_dir(&self, from_collection: &str, to_collection: &str) -> StorageResult<bool> {
        let from = self.collection_dir(from_collection);
        if !from.exists() {
            return Ok(false);
        }
        let to = self.collection_dir(to_collection);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(true)
    }

    /// A fresh location under the backup area
    pub fn backup_location(&self) -> PathBuf {
        self.backup_root.join(Uuid::new_v4().to_string())
    }

    /// Move a collection directory to `to` (normally a `backup_location`).
    /// False if the collection had no binary content.
    pub fn move_dir_to(&self, collection_path: &str, to: &Path) -> StorageResult<bool> {
        let from = self.collection_dir(collection_path);
        if !from.exists() {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, to)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_delete() {
        let temp = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp.path());
        let info = blobs.write("/db/a", "x.bin", b"hello").unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.digest, digest(b"hello"));
        assert!(temp.path().join("fs/db/a/x.bin").exists());
        assert_eq!(blobs.read("/db/a", "x.bin").unwrap(), b"hello");
        assert!(blobs.delete("/db/a", "x.bin").unwrap());
        assert!(!blobs.delete("/db/a", "x.bin").unwrap());
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let temp = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp.path());
        assert!(matches!(blobs.read("/db", "nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_backup_moves_directory() {
        let temp = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp.path());
        blobs.write("/db/gone", "a.bin", b"1").unwrap();
        let backup = blobs.backup_location();
        assert!(backup.starts_with(temp.path().join("fs.journal")));
        assert!(blobs.move_dir_to("/db/gone", &backup).unwrap());
        assert!(backup.join("a.bin").exists());
        assert!(!blobs.collection_dir("/db/gone").exists());
        assert!(!blobs.move_dir_to("/db/never", &blobs.backup_location()).unwrap());
    }

    #[test]
    fn test_rename_dir() {
        let temp = TempDir::new().unwrap();
        let blobs = BlobStore::new(temp.path());
        blobs.write("/db/old", "a.bin", b"1").unwrap();
        assert!(blobs.rename_dir("/db/old", "/db/new/place").unwrap());
        assert_eq!(blobs.read("/db/new/place", "a.bin").unwrap(), b"1");
    }
}
