//! Collection operations of the native store

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::{StorageError, StorageResult};
use crate::index::{IndexConfig, ReindexMode};
use crate::observability::{log_event_with_fields, Event, Logger};
use crate::security::{Permission, Subject, EXECUTE, READ, WRITE};
use crate::txn::{JournalRecord, LockMode, ReentrantLock, Txn};

use super::collection::{
    normalize_path, path_segments, validate_name, Collection, CollectionCache, ROOT_COLLECTION,
};
use super::document::{DocumentRecord, ResourceType};
use super::NativeStore;

/// A collection together with its documents, captured under the cache monitor
pub(crate) type TreeEntry = (Collection, Vec<DocumentRecord>);

/// A collection held under a lock until the guard is dropped
pub struct LockedCollection {
    lock: Arc<ReentrantLock>,
    mode: LockMode,
    collection: Collection,
}

impl LockedCollection {
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockedCollection {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.mode) {
            Logger::warn(
                "COLLECTION_LOCK_RELEASE_FAILED",
                &[("path", &self.collection.path), ("error", &e.to_string())],
            );
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListedDocument {
    pub name: String,
    pub resource_type: ResourceType,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionListing {
    pub path: String,
    pub permission: String,
    pub owner: String,
    pub collections: Vec<String>,
    pub documents: Vec<ListedDocument>,
}

/// True when `path` lies strictly inside `ancestor`.
fn is_below(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && (ancestor == "/" || path.as_bytes()[ancestor.len()] == b'/')
}

impl NativeStore {
    /// Resolve `path`, creating every missing collection on the way.
    pub fn get_or_create_collection(&self, subject: &Subject, path: &str) -> StorageResult<Collection> {
        let segments: Vec<String> = path_segments(path)?.iter().map(|s| s.to_string()).collect();
        if let Some(existing) = self.cache()?.by_path(&normalize_path(path)?) {
            return Ok(existing.clone());
        }
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let mut current = self.cache()?.require_path(ROOT_COLLECTION)?.id;
            for segment in &segments[1..] {
                let child_path = format!("{}/{}", self.cache()?.collection(current)?.path, segment);
                let existing = self.cache()?.by_path(&child_path).map(|c| c.id);
                if let Some(id) = existing {
                    current = id;
                    continue;
                }

                self.lock_collection(txn, current, LockMode::Write)?;
                // Re-check under the lock: another broker may have won the race.
                let existing = self.cache()?.by_path(&child_path).map(|c| c.id);
                if let Some(id) = existing {
                    current = id;
                    continue;
                }
                {
                    let cache = self.cache()?;
                    let parent = cache.collection(current)?;
                    self.check(subject, &parent.permission, WRITE | EXECUTE, &parent.path)?;
                    if parent.documents.contains_key(segment.as_str()) {
                        return Err(StorageError::invalid(format!(
                            "a document named {} already exists in {}",
                            segment, parent.path
                        )));
                    }
                }
                self.hooks
                    .before_collection(|h| h.before_create(subject, &child_path))?;
                let child = {
                    let mut cache = self.cache()?;
                    self.insert_child_collection(&mut cache, subject, current, segment, None)?
                };
                self.hooks.after_collection(|h| h.after_create(subject, &child));
                current = child.id;
            }
            Ok(self.cache()?.collection(current)?.clone())
        })
    }

    /// Create `name` under `parent_id`. A template supplies mode and index
    /// configuration (used when copying).
    pub(crate) fn insert_child_collection(
        &self,
        cache: &mut CollectionCache,
        subject: &Subject,
        parent_id: u32,
        name: &str,
        template: Option<&Collection>,
    ) -> StorageResult<Collection> {
        validate_name(name)?;
        let (path, parent_permission) = {
            let parent = cache.collection(parent_id)?;
            (parent.child_path(name), parent.permission.clone())
        };
        let mut permission = Permission::collection_for(subject);
        if let Some(template) = template {
            permission.mode = template.permission.mode;
        }
        if parent_permission.is_set_gid() {
            permission.group = parent_permission.group.clone();
            permission.set_set_gid(true);
        }

        let id = cache
            .collection_ids
            .allocate()
            .ok_or_else(|| StorageError::storage("collection id space exhausted"))?;
        let child = Collection {
            id,
            path,
            parent: Some(parent_id),
            permission,
            created: chrono::Utc::now(),
            children: Default::default(),
            documents: Default::default(),
            index_config: template.and_then(|t| t.index_config.clone()),
        };
        if let Err(e) = self.persist_collection(&child) {
            cache.collection_ids.release(id);
            return Err(e);
        }
        let parent = cache.collection_mut(parent_id)?;
        parent.children.insert(name.to_string());
        let parent_snapshot = parent.clone();
        self.persist_collection(&parent_snapshot)?;
        cache.put_collection(child.clone());

        self.metrics.increment_collections_created();
        log_event_with_fields(
            Event::CollectionCreated,
            &[("path", &child.path), ("id", &child.id.to_string())],
        );
        Ok(child)
    }

    /// The collection, every descendant (parents first) and their documents
    pub(crate) fn snapshot_tree(&self, id: u32) -> StorageResult<Vec<TreeEntry>> {
        let cache = self.cache()?;
        cache
            .subtree(id)?
            .into_iter()
            .map(|cid| {
                let collection = cache.collection(cid)?.clone();
                let documents = collection
                    .documents
                    .values()
                    .map(|doc_id| cache.document(*doc_id).cloned())
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok((collection, documents))
            })
            .collect()
    }

    fn validate_readable(&self, subject: &Subject, tree: &[TreeEntry]) -> StorageResult<()> {
        for (collection, documents) in tree {
            self.check(subject, &collection.permission, READ | EXECUTE, &collection.path)?;
            for doc in documents {
                self.check(subject, &doc.permission, READ, &collection.child_path(&doc.name))?;
            }
        }
        Ok(())
    }

    /// Removal needs WRITE and EXECUTE on each parent, READ on each
    /// collection, and WRITE and EXECUTE on each non-empty collection.
    fn validate_removable(
        &self,
        subject: &Subject,
        tree: &[TreeEntry],
        top_parent: Option<&Collection>,
    ) -> StorageResult<()> {
        for (i, (collection, _)) in tree.iter().enumerate() {
            let parent = if i == 0 {
                top_parent
            } else {
                tree.iter()
                    .map(|(c, _)| c)
                    .find(|c| Some(c.id) == collection.parent)
            };
            if let Some(parent) = parent {
                self.check(subject, &parent.permission, WRITE | EXECUTE, &parent.path)?;
            }
            self.check(subject, &collection.permission, READ, &collection.path)?;
            if !collection.is_empty() {
                self.check(subject, &collection.permission, WRITE | EXECUTE, &collection.path)?;
            }
        }
        Ok(())
    }

    fn before_delete_tree(&self, subject: &Subject, tree: &[TreeEntry]) -> StorageResult<()> {
        for (collection, documents) in tree {
            for doc in documents {
                self.hooks.before_document(|h| h.before_delete(subject, doc))?;
            }
            self.hooks
                .before_collection(|h| h.before_delete(subject, &collection.path))?;
        }
        Ok(())
    }

    /// Remove a validated subtree, children before parents. The root
    /// collection is emptied instead of deleted.
    fn remove_tree(&self, txn: &Txn, subject: &Subject, tree: &[TreeEntry]) -> StorageResult<()> {
        for (collection, documents) in tree.iter().rev() {
            for doc in documents {
                self.purge_document(txn, doc, &collection.path, true)?;
                let doc_path = collection.child_path(&doc.name);
                self.hooks.after_document(|h| h.after_delete(subject, &doc_path));
            }
            let dropped = self.values.drop_collection(collection.id).map(|_| ());
            self.absorb_index_error("values", dropped)?;

            if collection.is_root() {
                let mut cache = self.cache()?;
                let root = cache.collection_mut(collection.id)?;
                root.documents.clear();
                let snapshot = root.clone();
                self.persist_collection(&snapshot)?;
                Logger::info("ROOT_COLLECTION_TRUNCATED", &[("path", &collection.path)]);
                continue;
            }

            if self.blobs.collection_dir(&collection.path).exists() {
                let backup = self.blobs.backup_location();
                self.journal(
                    txn,
                    JournalRecord::RenameBinaryDir {
                        from: self.blobs.collection_dir(&collection.path).display().to_string(),
                        to: backup.display().to_string(),
                    },
                )?;
                self.blobs.move_dir_to(&collection.path, &backup)?;
            }

            {
                let mut cache = self.cache()?;
                if let Some(parent_id) = collection.parent {
                    if let Ok(parent) = cache.collection_mut(parent_id) {
                        parent.children.remove(collection.name());
                        let snapshot = parent.clone();
                        self.persist_collection(&snapshot)?;
                    }
                }
                cache.remove_collection(collection.id);
                cache.collection_ids.release(collection.id);
            }
            self.delete_collection_record(collection.id)?;

            self.metrics.increment_collections_removed();
            log_event_with_fields(
                Event::CollectionRemoved,
                &[("path", &collection.path), ("id", &collection.id.to_string())],
            );
            self.hooks
                .after_collection(|h| h.after_delete(subject, &collection.path));
        }
        Ok(())
    }

    /// Remove a collection with all descendants and documents.
    ///
    /// Permissions are checked over the whole subtree before anything is
    /// touched. Binary content is moved to the backup area, not deleted.
    pub fn remove_collection(&self, subject: &Subject, path: &str) -> StorageResult<()> {
        let path = normalize_path(path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let (id, parent_id) = {
                let cache = self.cache()?;
                let collection = cache.require_path(&path)?;
                (collection.id, collection.parent)
            };
            if let Some(parent_id) = parent_id {
                self.lock_collection(txn, parent_id, LockMode::Write)?;
            }
            self.lock_collection(txn, id, LockMode::Write)?;

            let tree = self.snapshot_tree(id)?;
            let parent = match parent_id {
                Some(pid) => Some(self.cache()?.collection(pid)?.clone()),
                None => None,
            };
            self.validate_removable(subject, &tree, parent.as_ref())?;
            self.before_delete_tree(subject, &tree)?;
            self.remove_tree(txn, subject, &tree)
        })
    }

    /// Copy `source` with its subtree to `target_parent/new_name`.
    ///
    /// Every copied collection and document gets a fresh id. An existing
    /// collection at the target is removed first.
    pub fn copy_collection(
        &self,
        subject: &Subject,
        source: &str,
        target_parent: &str,
        new_name: &str,
    ) -> StorageResult<Collection> {
        validate_name(new_name)?;
        let source = normalize_path(source)?;
        let target_parent = normalize_path(target_parent)?;
        let target_path = format!("{}/{}", target_parent, new_name);
        if target_path == source || is_below(&target_path, &source) {
            return Err(StorageError::invalid(format!(
                "cannot copy {} into itself",
                source
            )));
        }
        if is_below(&source, &target_path) {
            return Err(StorageError::invalid(format!(
                "cannot copy {} over its ancestor {}",
                source, target_path
            )));
        }
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let (src_id, dest_parent_id, existing) = {
                let cache = self.cache()?;
                (
                    cache.require_path(&source)?.id,
                    cache.require_path(&target_parent)?.id,
                    cache.by_path(&target_path).map(|c| c.id),
                )
            };
            self.lock_collection(txn, src_id, LockMode::Read)?;
            self.lock_collection(txn, dest_parent_id, LockMode::Write)?;
            if let Some(existing) = existing {
                self.lock_collection(txn, existing, LockMode::Write)?;
            }

            let tree = self.snapshot_tree(src_id)?;
            let existing_tree = existing.map(|id| self.snapshot_tree(id)).transpose()?;
            let dest_parent = self.cache()?.collection(dest_parent_id)?.clone();
            self.validate_readable(subject, &tree)?;
            self.check(subject, &dest_parent.permission, WRITE | EXECUTE, &dest_parent.path)?;
            if dest_parent.documents.contains_key(new_name) {
                return Err(StorageError::invalid(format!(
                    "a document named {} already exists in {}",
                    new_name, dest_parent.path
                )));
            }
            if let Some(existing_tree) = &existing_tree {
                self.validate_removable(subject, existing_tree, Some(&dest_parent))?;
            }

            self.hooks
                .before_collection(|h| h.before_copy(subject, &source, &target_path))?;
            for (collection, documents) in &tree {
                let dest_path = format!("{}{}", target_path, &collection.path[source.len()..]);
                for doc in documents {
                    let doc_target = format!("{}/{}", dest_path, doc.name);
                    self.hooks
                        .before_document(|h| h.before_copy(subject, doc, &doc_target))?;
                }
            }
            if let Some(existing_tree) = &existing_tree {
                self.before_delete_tree(subject, existing_tree)?;
                self.remove_tree(txn, subject, existing_tree)?;
            }

            let copied = self.copy_tree(txn, subject, &tree, dest_parent_id, new_name)?;
            log_event_with_fields(
                Event::CollectionCopied,
                &[("source", &source), ("target", &copied.path)],
            );
            self.hooks
                .after_collection(|h| h.after_copy(subject, &source, &copied));
            Ok(copied)
        })
    }

    fn copy_tree(
        &self,
        txn: &mut Txn,
        subject: &Subject,
        tree: &[TreeEntry],
        dest_parent_id: u32,
        new_name: &str,
    ) -> StorageResult<Collection> {
        let mut mapping: HashMap<u32, u32> = HashMap::new();
        let mut top = None;
        for (i, (collection, documents)) in tree.iter().enumerate() {
            let (parent_id, name) = if i == 0 {
                (dest_parent_id, new_name)
            } else {
                let parent = collection
                    .parent
                    .and_then(|p| mapping.get(&p).copied())
                    .ok_or_else(|| StorageError::storage(format!("orphan {}", collection.path)))?;
                (parent, collection.name())
            };
            let created = {
                let mut cache = self.cache()?;
                self.insert_child_collection(&mut cache, subject, parent_id, name, Some(collection))?
            };
            self.lock_collection(txn, created.id, LockMode::Write)?;
            mapping.insert(collection.id, created.id);
            top.get_or_insert(created.id);

            for doc in documents {
                let copy = self.copy_document_into(txn, subject, doc, &collection.path, created.id, &doc.name)?;
                let source_path = collection.child_path(&doc.name);
                self.hooks
                    .after_document(|h| h.after_copy(subject, &source_path, &copy));
            }
        }
        let top = top.ok_or_else(|| StorageError::storage("empty copy source"))?;
        Ok(self.cache()?.collection(top)?.clone())
    }

    /// Move `source` with its subtree to `target_parent/new_name`.
    ///
    /// Collection and document ids are kept. Documents whose effective index
    /// configuration changes are reindexed.
    pub fn move_collection(
        &self,
        subject: &Subject,
        source: &str,
        target_parent: &str,
        new_name: &str,
    ) -> StorageResult<Collection> {
        validate_name(new_name)?;
        let source = normalize_path(source)?;
        let target_parent = normalize_path(target_parent)?;
        let target_path = format!("{}/{}", target_parent, new_name);
        if source == ROOT_COLLECTION {
            return Err(StorageError::invalid("cannot move the root collection"));
        }
        if target_path == source
            || target_parent == source
            || is_below(&target_parent, &source)
            || is_below(&source, &target_path)
        {
            return Err(StorageError::invalid(format!(
                "cannot move {} to {}",
                source, target_path
            )));
        }
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let (src_id, src_parent_id, dest_parent_id, existing) = {
                let cache = self.cache()?;
                let src = cache.require_path(&source)?;
                let src_parent = src
                    .parent
                    .ok_or_else(|| StorageError::invalid("cannot move the root collection"))?;
                (
                    src.id,
                    src_parent,
                    cache.require_path(&target_parent)?.id,
                    cache.by_path(&target_path).map(|c| c.id),
                )
            };
            self.lock_collection(txn, src_parent_id, LockMode::Write)?;
            self.lock_collection(txn, src_id, LockMode::Write)?;
            self.lock_collection(txn, dest_parent_id, LockMode::Write)?;
            if let Some(existing) = existing {
                self.lock_collection(txn, existing, LockMode::Write)?;
            }

            let tree = self.snapshot_tree(src_id)?;
            let existing_tree = existing.map(|id| self.snapshot_tree(id)).transpose()?;
            let (src_parent, dest_parent) = {
                let cache = self.cache()?;
                (
                    cache.collection(src_parent_id)?.clone(),
                    cache.collection(dest_parent_id)?.clone(),
                )
            };
            self.check(subject, &src_parent.permission, WRITE | EXECUTE, &src_parent.path)?;
            self.check(subject, &tree[0].0.permission, WRITE, &source)?;
            self.validate_readable(subject, &tree)?;
            self.check(subject, &dest_parent.permission, WRITE | EXECUTE, &dest_parent.path)?;
            if dest_parent.documents.contains_key(new_name) {
                return Err(StorageError::invalid(format!(
                    "a document named {} already exists in {}",
                    new_name, dest_parent.path
                )));
            }
            if let Some(existing_tree) = &existing_tree {
                self.validate_removable(subject, existing_tree, Some(&dest_parent))?;
            }

            self.hooks
                .before_collection(|h| h.before_move(subject, &source, &target_path))?;
            if let Some(existing_tree) = &existing_tree {
                self.before_delete_tree(subject, existing_tree)?;
                self.remove_tree(txn, subject, existing_tree)?;
            }

            let ids: Vec<u32> = tree.iter().map(|(c, _)| c.id).collect();
            let configs_before = self.effective_configs(&ids)?;
            {
                let mut cache = self.cache()?;
                let old_name = tree[0].0.name().to_string();
                let from = cache.collection_mut(src_parent_id)?;
                from.children.remove(&old_name);
                let snapshot = from.clone();
                self.persist_collection(&snapshot)?;

                let to = cache.collection_mut(dest_parent_id)?;
                to.children.insert(new_name.to_string());
                let snapshot = to.clone();
                self.persist_collection(&snapshot)?;

                cache.collection_mut(src_id)?.parent = Some(dest_parent_id);
                for (collection, _) in &tree {
                    let new_path = format!("{}{}", target_path, &collection.path[source.len()..]);
                    cache.repath(collection.id, new_path)?;
                    let snapshot = cache.collection(collection.id)?.clone();
                    self.persist_collection(&snapshot)?;
                }
            }

            if self.blobs.collection_dir(&source).exists() {
                self.journal(
                    txn,
                    JournalRecord::RenameBinaryDir {
                        from: self.blobs.collection_dir(&source).display().to_string(),
                        to: self.blobs.collection_dir(&target_path).display().to_string(),
                    },
                )?;
                self.blobs.rename_dir(&source, &target_path)?;
            }
            self.reindex_changed(configs_before)?;

            let moved = self.cache()?.collection(src_id)?.clone();
            log_event_with_fields(
                Event::CollectionMoved,
                &[("source", &source), ("target", &moved.path)],
            );
            self.hooks
                .after_collection(|h| h.after_move(subject, &source, &moved));
            Ok(moved)
        })
    }

    fn effective_configs(&self, ids: &[u32]) -> StorageResult<Vec<(u32, Option<IndexConfig>)>> {
        let cache = self.cache()?;
        Ok(ids
            .iter()
            .map(|id| (*id, cache.effective_index_config(*id)))
            .collect())
    }

    /// Repair-reindex the documents of every collection whose effective
    /// configuration differs from `before`.
    fn reindex_changed(&self, before: Vec<(u32, Option<IndexConfig>)>) -> StorageResult<()> {
        for (id, old_config) in before {
            let (config, documents) = {
                let cache = self.cache()?;
                let config = cache.effective_index_config(id);
                if config == old_config {
                    continue;
                }
                let collection = cache.collection(id)?;
                let documents = collection
                    .documents
                    .values()
                    .map(|d| cache.document(*d).cloned())
                    .collect::<StorageResult<Vec<_>>>()?;
                (config, documents)
            };
            for doc in documents.iter().filter(|d| d.is_xml()) {
                self.reindex_document(doc, config.clone(), ReindexMode::Repair)?;
            }
        }
        Ok(())
    }

    /// Lock a collection and hand it out under a guard.
    pub fn open_collection(
        &self,
        subject: &Subject,
        path: &str,
        mode: LockMode,
    ) -> StorageResult<LockedCollection> {
        let path = normalize_path(path)?;
        let lock = {
            let cache = self.cache()?;
            let collection = cache.require_path(&path)?;
            self.check(subject, &collection.permission, READ, &collection.path)?;
            cache.lock_for(collection.id)?
        };
        lock.acquire(mode, self.lock_timeout)?;
        let current = self.cache().map(|cache| cache.by_path(&path).cloned());
        match current {
            Ok(Some(collection)) => Ok(LockedCollection {
                lock,
                mode,
                collection,
            }),
            Ok(None) => {
                lock.release(mode)?;
                Err(StorageError::not_found(format!("collection {}", path)))
            }
            Err(e) => {
                lock.release(mode)?;
                Err(e)
            }
        }
    }

    pub fn list_collection(&self, subject: &Subject, path: &str) -> StorageResult<CollectionListing> {
        let path = normalize_path(path)?;
        let cache = self.cache()?;
        let collection = cache.require_path(&path)?;
        self.check(subject, &collection.permission, READ, &collection.path)?;
        let documents = collection
            .documents
            .values()
            .map(|id| {
                let doc = cache.document(*id)?;
                Ok(ListedDocument {
                    name: doc.name.clone(),
                    resource_type: doc.resource_type,
                    size: doc.metadata.content_length,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(CollectionListing {
            path: collection.path.clone(),
            permission: collection.permission.mode_string(),
            owner: collection.permission.owner.clone(),
            collections: collection.children.iter().cloned().collect(),
            documents,
        })
    }

    /// Set or clear the index configuration of a collection and repair the
    /// documents it affects.
    pub fn set_index_config(
        &self,
        subject: &Subject,
        path: &str,
        config: Option<IndexConfig>,
    ) -> StorageResult<()> {
        let path = normalize_path(path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let id = self.cache()?.require_path(&path)?.id;
            self.lock_collection(txn, id, LockMode::Write)?;
            let ids = self.cache()?.subtree(id)?;
            let before = self.effective_configs(&ids)?;
            {
                let mut cache = self.cache()?;
                let collection = cache.collection_mut(id)?;
                self.check(subject, &collection.permission, WRITE, &collection.path)?;
                collection.index_config = config.clone();
                let snapshot = collection.clone();
                self.persist_collection(&snapshot)?;
            }
            for sub in &ids {
                self.lock_collection(txn, *sub, LockMode::Write)?;
            }
            self.reindex_changed(before)
        })
    }

    /// Replace a collection's permission; owner or admin only.
    pub fn set_collection_permission(
        &self,
        subject: &Subject,
        path: &str,
        permission: Permission,
    ) -> StorageResult<()> {
        let path = normalize_path(path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let id = self.cache()?.require_path(&path)?.id;
            self.lock_collection(txn, id, LockMode::Write)?;
            let mut cache = self.cache()?;
            let collection = cache.collection_mut(id)?;
            if collection.permission.owner != subject.name() && !self.security.has_admin_role(subject) {
                return Err(StorageError::permission_denied(format!(
                    "{} does not own {}",
                    subject.name(),
                    path
                )));
            }
            collection.permission = permission;
            let snapshot = collection.clone();
            self.persist_collection(&snapshot)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::test_support::*;
    use super::super::HookSet;
    use super::*;
    use crate::dom::XmlNode;
    use crate::security::{SET_GID, SYSTEM_USER};
    use crate::storage::{CollectionHook, DocumentHook};
    use tempfile::TempDir;

    fn sample() -> Vec<XmlNode> {
        vec![XmlNode::element("test").attr("id", "42").text_child("a", "xy")]
    }

    // ==================== Creation ====================

    #[test]
    fn test_create_nested_collections() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let c = store.get_or_create_collection(&admin(), "/db/a/b/c").unwrap();
        assert_eq!(c.path, "/db/a/b/c");
        let a = store.get_collection("/db/a").unwrap().unwrap();
        assert!(a.children.contains("b"));
        // idempotent
        let again = store.get_or_create_collection(&admin(), "/db/a/b/c").unwrap();
        assert_eq!(again.id, c.id);
    }

    #[test]
    fn test_guest_cannot_create_under_root() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let err = store
            .get_or_create_collection(&Subject::guest(), "/db/guest")
            .unwrap_err();
        assert!(err.is_permission_denied());
        assert!(store.get_collection("/db/guest").unwrap().is_none());
    }

    #[test]
    fn test_set_gid_group_is_inherited() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/shared").unwrap();
        store
            .set_collection_permission(
                &admin(),
                "/db/shared",
                Permission::new("admin", "editors", 0o775 | SET_GID),
            )
            .unwrap();
        let alice = Subject::new("alice", &["users", "editors"]);
        let child = store.get_or_create_collection(&alice, "/db/shared/notes").unwrap();
        assert_eq!(child.permission.owner, "alice");
        assert_eq!(child.permission.group, "editors");
        assert!(child.permission.is_set_gid());
    }

    /// A vetoing before-hook leaves nothing behind.
    #[test]
    fn test_before_hook_aborts_creation() {
        struct Veto;
        impl CollectionHook for Veto {
            fn before_create(&self, _subject: &Subject, path: &str) -> StorageResult<()> {
                if path.ends_with("forbidden") {
                    return Err(StorageError::invalid("vetoed"));
                }
                Ok(())
            }
        }
        let temp = TempDir::new().unwrap();
        let store = open_with(&temp, HookSet::new().with_collection_hook(Arc::new(Veto)), |_| {});
        assert!(store.get_or_create_collection(&admin(), "/db/forbidden").is_err());
        assert!(store.get_collection("/db/forbidden").unwrap().is_none());
        assert!(store.get_or_create_collection(&admin(), "/db/fine").is_ok());
    }

    // ==================== Copy and move ====================

    #[test]
    fn test_copy_collection_assigns_fresh_ids() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/src/sub").unwrap();
        let doc = store.store_xml_resource(&admin(), "/db/src/sub", "t.xml", &sample()).unwrap();

        let copy = store.copy_collection(&admin(), "/db/src", "/db", "dst").unwrap();
        assert_eq!(copy.path, "/db/dst");
        let src = store.get_collection("/db/src").unwrap().unwrap();
        assert_ne!(copy.id, src.id);
        let copied_doc = store.get_document("/db/dst/sub/t.xml").unwrap().unwrap();
        assert_ne!(copied_doc.id, doc.id);
        assert_eq!(
            store.get_xml_resource(&admin(), "/db/dst/sub/t.xml").unwrap(),
            store.get_xml_resource(&admin(), "/db/src/sub/t.xml").unwrap()
        );
    }

    #[test]
    fn test_copy_into_own_subtree_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/a").unwrap();
        let err = store.copy_collection(&admin(), "/db/a", "/db/a", "a2").unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn test_move_collection_repaths_subtree() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let deep = store.get_or_create_collection(&admin(), "/db/a/b/c").unwrap();
        store.get_or_create_collection(&admin(), "/db/target").unwrap();

        let moved = store.move_collection(&admin(), "/db/a/b", "/db/target", "renamed").unwrap();
        assert_eq!(moved.path, "/db/target/renamed");
        assert!(store.get_collection("/db/a/b").unwrap().is_none());
        let deep_after = store.get_collection("/db/target/renamed/c").unwrap().unwrap();
        assert_eq!(deep_after.id, deep.id);
        assert!(!store.get_collection("/db/a").unwrap().unwrap().children.contains("b"));
    }

    #[test]
    fn test_move_root_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/x").unwrap();
        assert!(store.move_collection(&admin(), "/db", "/db/x", "y").is_err());
    }

    /// An existing collection at the target is replaced by the copy.
    #[test]
    fn test_copy_over_existing_target_replaces_it() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/src").unwrap();
        store.store_xml_resource(&admin(), "/db/src", "new.xml", &sample()).unwrap();
        store.get_or_create_collection(&admin(), "/db/dst/stale").unwrap();
        store.store_xml_resource(&admin(), "/db/dst", "old.xml", &sample()).unwrap();

        let copy = store.copy_collection(&admin(), "/db/src", "/db", "dst").unwrap();
        assert_eq!(copy.path, "/db/dst");
        assert!(store.get_document("/db/dst/new.xml").unwrap().is_some());
        assert!(store.get_document("/db/dst/old.xml").unwrap().is_none());
        assert!(store.get_collection("/db/dst/stale").unwrap().is_none());
        assert!(store.get_document("/db/src/new.xml").unwrap().is_some());
    }

    /// Copying a collection over one of its own ancestors fails untouched.
    #[test]
    fn test_copy_over_ancestor_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/a/b").unwrap();
        store.store_xml_resource(&admin(), "/db/a/b", "t.xml", &sample()).unwrap();

        let err = store.copy_collection(&admin(), "/db/a/b", "/db", "a").unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(store.get_collection("/db/a/b").unwrap().is_some());
        assert_eq!(store.get_xml_resource(&admin(), "/db/a/b/t.xml").unwrap(), sample());
    }

    #[test]
    fn test_move_over_ancestor_rejected() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/a/b").unwrap();
        store.store_xml_resource(&admin(), "/db/a/b", "t.xml", &sample()).unwrap();

        let err = store.move_collection(&admin(), "/db/a/b", "/db", "a").unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        assert!(store.get_collection("/db/a").unwrap().unwrap().children.contains("b"));
        assert_eq!(store.get_xml_resource(&admin(), "/db/a/b/t.xml").unwrap(), sample());
        assert_eq!(store.stats().unwrap().documents, 1);
    }

    /// Moving onto an existing collection replaces it and keeps the moved ids.
    #[test]
    fn test_move_over_existing_target_replaces_it() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let src = store.get_or_create_collection(&admin(), "/db/a/b").unwrap();
        let doc = store.store_xml_resource(&admin(), "/db/a/b", "t.xml", &sample()).unwrap();
        store.get_or_create_collection(&admin(), "/db/t/b").unwrap();
        store.store_xml_resource(&admin(), "/db/t/b", "old.xml", &sample()).unwrap();

        let moved = store.move_collection(&admin(), "/db/a/b", "/db/t", "b").unwrap();
        assert_eq!(moved.id, src.id);
        assert_eq!(store.get_document("/db/t/b/t.xml").unwrap().unwrap().id, doc.id);
        assert!(store.get_document("/db/t/b/old.xml").unwrap().is_none());
        assert!(store.get_collection("/db/a/b").unwrap().is_none());
        assert_eq!(store.stats().unwrap().documents, 1);
    }

    /// Overwriting needs removal rights on the collection being replaced.
    #[test]
    fn test_copy_over_protected_target_denied() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let alice = Subject::new("alice", &["users"]);
        store.get_or_create_collection(&admin(), "/db/work").unwrap();
        store
            .set_collection_permission(&admin(), "/db/work", Permission::new("alice", "users", 0o755))
            .unwrap();
        store.get_or_create_collection(&alice, "/db/work/src").unwrap();
        store.get_or_create_collection(&alice, "/db/work/dst/locked").unwrap();
        store
            .set_collection_permission(
                &admin(),
                "/db/work/dst/locked",
                Permission::new(SYSTEM_USER, "dba", 0o700),
            )
            .unwrap();

        let err = store.copy_collection(&alice, "/db/work/src", "/db/work", "dst").unwrap_err();
        assert!(err.is_permission_denied());
        assert!(store.get_collection("/db/work/dst/locked").unwrap().is_some());
    }

    /// Every document of a copied tree goes through the document copy hooks.
    #[test]
    fn test_copy_collection_fires_document_hooks() {
        #[derive(Default)]
        struct Copies {
            before: AtomicUsize,
            after: AtomicUsize,
        }
        impl DocumentHook for Copies {
            fn before_copy(&self, _subject: &Subject, _source: &DocumentRecord, target: &str) -> StorageResult<()> {
                if target.ends_with("veto.xml") {
                    return Err(StorageError::invalid("vetoed"));
                }
                self.before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn after_copy(&self, _subject: &Subject, _source: &str, _document: &DocumentRecord) {
                self.after.fetch_add(1, Ordering::SeqCst);
            }
        }
        let copies = Arc::new(Copies::default());
        let temp = TempDir::new().unwrap();
        let store = open_with(&temp, HookSet::new().with_document_hook(copies.clone()), |_| {});
        store.get_or_create_collection(&admin(), "/db/src/sub").unwrap();
        store.store_xml_resource(&admin(), "/db/src", "one.xml", &sample()).unwrap();
        store
            .store_binary_resource(&admin(), "/db/src/sub", "two.bin", b"data", "application/octet-stream")
            .unwrap();

        store.copy_collection(&admin(), "/db/src", "/db", "dst").unwrap();
        assert_eq!(copies.before.load(Ordering::SeqCst), 2);
        assert_eq!(copies.after.load(Ordering::SeqCst), 2);

        store.store_xml_resource(&admin(), "/db/src/sub", "veto.xml", &sample()).unwrap();
        assert!(store.copy_collection(&admin(), "/db/src", "/db", "again").is_err());
        assert!(store.get_collection("/db/again").unwrap().is_none());
    }

    // ==================== Removal ====================

    #[test]
    fn test_remove_collection_removes_documents() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/gone/inner").unwrap();
        store.store_xml_resource(&admin(), "/db/gone/inner", "t.xml", &sample()).unwrap();
        store
            .store_binary_resource(&admin(), "/db/gone", "b.bin", b"data", "application/octet-stream")
            .unwrap();

        store.remove_collection(&admin(), "/db/gone").unwrap();
        assert!(store.get_collection("/db/gone").unwrap().is_none());
        assert!(store.get_collection("/db/gone/inner").unwrap().is_none());
        assert_eq!(store.stats().unwrap().documents, 0);
        assert_eq!(store.value_index().store().len().unwrap(), 0);
        assert!(!store.blobs().collection_dir("/db/gone").exists());
        assert!(temp.path().join("fs.journal").exists());
    }

    #[test]
    fn test_remove_checks_whole_subtree_first() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let bob = Subject::new("bob", &["users"]);
        store.get_or_create_collection(&admin(), "/db/home").unwrap();
        store
            .set_collection_permission(&admin(), "/db/home", Permission::new("bob", "users", 0o755))
            .unwrap();
        store.get_or_create_collection(&bob, "/db/home/mine/locked").unwrap();
        store
            .set_collection_permission(
                &admin(),
                "/db/home/mine/locked",
                Permission::new(SYSTEM_USER, "dba", 0o700),
            )
            .unwrap();

        let err = store.remove_collection(&bob, "/db/home/mine").unwrap_err();
        assert!(err.is_permission_denied());
        assert!(store.get_collection("/db/home/mine/locked").unwrap().is_some());
    }

    #[test]
    fn test_remove_root_truncates() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/a").unwrap();
        store.store_xml_resource(&admin(), "/db", "top.xml", &sample()).unwrap();
        store.remove_collection(&admin(), "/db").unwrap();
        let root = store.get_collection("/db").unwrap().unwrap();
        assert!(root.is_empty());
        assert_eq!(store.stats().unwrap().collections, 1);
    }

    #[test]
    fn test_delete_hooks_fire_per_collection() {
        #[derive(Default)]
        struct Counter(AtomicUsize);
        impl CollectionHook for Counter {
            fn after_delete(&self, _subject: &Subject, _path: &str) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter::default());
        let temp = TempDir::new().unwrap();
        let store = open_with(&temp, HookSet::new().with_collection_hook(counter.clone()), |_| {});
        store.get_or_create_collection(&admin(), "/db/x/y/z").unwrap();
        store.remove_collection(&admin(), "/db/x").unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }

    // ==================== Locks and listing ====================

    #[test]
    fn test_locked_collection_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/l").unwrap();
        {
            let guard = store.open_collection(&admin(), "/db/l", LockMode::Write).unwrap();
            assert_eq!(guard.collection().path, "/db/l");
            let lock = store.cache().unwrap().lock_for(guard.collection().id).unwrap();
            assert!(lock.is_locked());
        }
        let id = store.get_collection("/db/l").unwrap().unwrap().id;
        assert!(!store.cache().unwrap().lock_for(id).unwrap().is_locked());
    }

    #[test]
    fn test_list_collection() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.get_or_create_collection(&admin(), "/db/l/child").unwrap();
        store.store_xml_resource(&admin(), "/db/l", "t.xml", &sample()).unwrap();
        let listing = store.list_collection(&admin(), "/db/l").unwrap();
        assert_eq!(listing.collections, vec!["child".to_string()]);
        assert_eq!(listing.documents.len(), 1);
        assert_eq!(listing.documents[0].resource_type, ResourceType::Xml);
    }
}
