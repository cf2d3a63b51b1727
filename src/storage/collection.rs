//! Collection records and the in-memory collection cache
//!
//! Collections and documents are records in id-keyed tables; parent and
//! owner references are ids resolved through the cache. The cache lives
//! behind one mutex per instance (the cache monitor). Per-collection locks
//! are handed out from here but are only ever waited on after the monitor
//! has been released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};
use crate::index::IndexConfig;
use crate::security::Permission;
use crate::txn::ReentrantLock;

use super::document::DocumentRecord;
use super::ids::IdAllocator;

pub const ROOT_COLLECTION: &str = "/db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: u32,
    pub path: String,
    pub parent: Option<u32>,
    pub permission: Permission,
    pub created: DateTime<Utc>,
    /// Child collection names
    pub children: BTreeSet<String>,
    /// Document name to document id
    pub documents: BTreeMap<String, u32>,
    /// Value index configuration set on this collection
    #[serde(default)]
    pub index_config: Option<IndexConfig>,
}

impl Collection {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.documents.is_empty()
    }

    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.path, name)
    }
}

/// Split an absolute collection path into its segments.
///
/// `/db/a//b/` normalizes to `["db", "a", "b"]`. Paths must be rooted at `/db`.
pub fn path_segments(path: &str) -> StorageResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() != Some(&"db") {
        return Err(StorageError::invalid(format!(
            "collection path '{}' is not under {}",
            path, ROOT_COLLECTION
        )));
    }
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(StorageError::invalid(format!("relative segment in '{}'", path)));
    }
    Ok(segments)
}

pub fn normalize_path(path: &str) -> StorageResult<String> {
    Ok(format!("/{}", path_segments(path)?.join("/")))
}

/// `/db/a/b.xml` to (`/db/a`, `b.xml`)
pub fn split_resource_path(path: &str) -> StorageResult<(String, String)> {
    let normalized = normalize_path(path)?;
    match normalized.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() => {
            Ok((parent.to_string(), name.to_string()))
        }
        _ => Err(StorageError::invalid(format!("'{}' does not name a resource", path))),
    }
}

pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StorageError::invalid(format!("invalid name '{}'", name)));
    }
    Ok(())
}

pub(crate) struct CollectionCache {
    collections: BTreeMap<u32, Collection>,
    paths: HashMap<String, u32>,
    documents: BTreeMap<u32, DocumentRecord>,
    locks: HashMap<u32, Arc<ReentrantLock>>,
    pub(crate) collection_ids: IdAllocator,
    pub(crate) document_ids: IdAllocator,
}

impl CollectionCache {
    pub(crate) fn new(
        collections: Vec<Collection>,
        documents: Vec<DocumentRecord>,
        collection_ids: IdAllocator,
        document_ids: IdAllocator,
    ) -> Self {
        let mut cache = Self {
            collections: BTreeMap::new(),
            paths: HashMap::new(),
            documents: BTreeMap::new(),
            locks: HashMap::new(),
            collection_ids,
            document_ids,
        };
        for collection in collections {
            cache.put_collection(collection);
        }
        for document in documents {
            cache.put_document(document);
        }
        cache
    }

    pub(crate) fn collection(&self, id: u32) -> StorageResult<&Collection> {
        self.collections
            .get(&id)
            .ok_or_else(|| StorageError::storage(format!("collection id {} not in cache", id)))
    }

    pub(crate) fn collection_mut(&mut self, id: u32) -> StorageResult<&mut Collection> {
        self.collections
            .get_mut(&id)
            .ok_or_else(|| StorageError::storage(format!("collection id {} not in cache", id)))
    }

    pub(crate) fn by_path(&self, path: &str) -> Option<&Collection> {
        self.paths.get(path).and_then(|id| self.collections.get(id))
    }

    pub(crate) fn require_path(&self, path: &str) -> StorageResult<&Collection> {
        self.by_path(path)
            .ok_or_else(|| StorageError::not_found(format!("collection {}", path)))
    }

    pub(crate) fn put_collection(&mut self, collection: Collection) {
        self.paths.insert(collection.path.clone(), collection.id);
        self.locks
            .entry(collection.id)
            .or_insert_with(|| Arc::new(ReentrantLock::new(collection.path.clone())));
        self.collections.insert(collection.id, collection);
    }

    pub(crate) fn remove_collection(&mut self, id: u32) -> Option<Collection> {
        let removed = self.collections.remove(&id)?;
        self.paths.remove(&removed.path);
        self.locks.remove(&id);
        Some(removed)
    }

    /// Re-key a collection after its path changed.
    pub(crate) fn repath(&mut self, id: u32, new_path: String) -> StorageResult<()> {
        let collection = self.collection_mut(id)?;
        let old = std::mem::replace(&mut collection.path, new_path.clone());
        self.paths.remove(&old);
        self.paths.insert(new_path, id);
        Ok(())
    }

    pub(crate) fn lock_for(&self, id: u32) -> StorageResult<Arc<ReentrantLock>> {
        self.locks
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::storage(format!("no lock for collection id {}", id)))
    }

    /// The collection and every descendant, parents before children.
    pub(crate) fn subtree(&self, id: u32) -> StorageResult<Vec<u32>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let collection = self.collection(current)?;
            out.push(current);
            for child in collection.children.iter().rev() {
                let child_path = collection.child_path(child);
                let child_id = self
                    .paths
                    .get(&child_path)
                    .copied()
                    .ok_or_else(|| StorageError::storage(format!("dangling child {}", child_path)))?;
                stack.push(child_id);
            }
        }
        Ok(out)
    }

    /// Nearest configuration on the collection or one of its ancestors
    pub(crate) fn effective_index_config(&self, id: u32) -> Option<IndexConfig> {
        let mut cursor = self.collections.get(&id);
        while let Some(collection) = cursor {
            if let Some(config) = &collection.index_config {
                return Some(config.clone());
            }
            cursor = collection.parent.and_then(|p| self.collections.get(&p));
        }
        None
    }

    pub(crate) fn document(&self, id: u32) -> StorageResult<&DocumentRecord> {
        self.documents
            .get(&id)
            .ok_or_else(|| StorageError::storage(format!("document id {} not in cache", id)))
    }

    pub(crate) fn document_mut(&mut self, id: u32) -> StorageResult<&mut DocumentRecord> {
        self.documents
            .get_mut(&id)
            .ok_or_else(|| StorageError::storage(format!("document id {} not in cache", id)))
    }

    pub(crate) fn document_in(&self, collection: &Collection, name: &str) -> Option<&DocumentRecord> {
        collection
            .documents
            .get(name)
            .and_then(|id| self.documents.get(id))
    }

    pub(crate) fn put_document(&mut self, document: DocumentRecord) {
        self.documents.insert(document.id, document);
    }

    pub(crate) fn remove_document(&mut self, id: u32) -> Option<DocumentRecord> {
        self.documents.remove(&id)
    }

    pub(crate) fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub(crate) fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize_path("/db/a//b/").unwrap(), "/db/a/b");
        assert_eq!(normalize_path("db").unwrap(), "/db");
        assert!(normalize_path("/other/a").is_err());
        assert!(normalize_path("/db/../x").is_err());
    }

    #[test]
    fn test_split_resource_path() {
        assert_eq!(
            split_resource_path("/db/a/b.xml").unwrap(),
            ("/db/a".to_string(), "b.xml".to_string())
        );
        assert!(split_resource_path("/db").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ok.xml").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
    }
}
