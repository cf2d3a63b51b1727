//! Native storage facade
//!
//! `NativeStore` owns every persistent structure of an instance:
//!
//! - `collections` / `documents`: id-keyed record tables (JSON values)
//! - `dom`: address-chained node records, one chain per XML document
//! - `nodes`: (doc id, node id) to node address for elements up to
//!   `index_depth`, used as entry points into the chain
//! - the value and structural indexes
//! - the binary filesystem area
//!
//! Every mutating operation runs inside a transaction. Collection locks are
//! taken through the transaction and held until it ends. The cache monitor
//! is never held while waiting on a collection lock.
//!
//! Index maintenance failures other than read-only are logged and counted,
//! never returned: a reindex repairs them.

mod blob;
mod collection;
mod collections;
mod document;
mod documents;
mod hooks;
mod ids;
mod nodes;

pub use blob::{digest, BlobInfo, BlobStore};
pub use collection::{
    normalize_path, path_segments, split_resource_path, validate_name, Collection, ROOT_COLLECTION,
};
pub use collections::{CollectionListing, ListedDocument, LockedCollection};
pub use document::{DocumentMetadata, DocumentRecord, DocumentState, ResourceType};
pub use hooks::{CollectionHook, DocumentHook, HookSet};
pub use ids::{IdAllocator, MAX_COLLECTION_ID, MAX_DOCUMENT_ID};
pub use nodes::ReindexReport;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::btree::{BTreeStore, DomFile};
use crate::config::DatabaseConfig;
use crate::errors::{StorageError, StorageResult};
use crate::index::{DocumentSet, NativeValueIndex, StructuralIndex};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};
use crate::security::{Permission, SecurityManager, Subject, DBA_GROUP, SYSTEM_USER};
use crate::txn::{LockMode, TransactionManager, Txn};

use collection::CollectionCache;

const COLLECTIONS_FILE: &str = "collections";
const DOCUMENTS_FILE: &str = "documents";
const NODES_FILE: &str = "nodes";

/// Minor syncs flush the index files, major syncs flush everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Minor,
    Major,
}

/// Counts reported by `NativeStore::stats`
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub collections: usize,
    pub documents: usize,
    pub node_records: usize,
    pub value_keys: usize,
    pub structure_keys: usize,
    pub read_only: bool,
}

pub(crate) fn id_key(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn load_records<T: DeserializeOwned>(store: &BTreeStore) -> StorageResult<Vec<T>> {
    let mut out = Vec::new();
    store.query_prefix(&[], |_, value| {
        out.push(serde_json::from_slice(value)?);
        Ok(true)
    })?;
    Ok(out)
}

pub struct NativeStore {
    data_dir: PathBuf,
    index_depth: u32,
    lock_timeout: Duration,
    security: Arc<dyn SecurityManager>,
    txn_manager: Arc<TransactionManager>,
    metrics: Arc<MetricsRegistry>,
    hooks: HookSet,
    cache: Mutex<CollectionCache>,
    collection_store: BTreeStore,
    document_store: BTreeStore,
    node_index: BTreeStore,
    dom: DomFile,
    values: NativeValueIndex,
    structure: StructuralIndex,
    blobs: BlobStore,
    read_only: AtomicBool,
    closed: AtomicBool,
}

impl NativeStore {
    /// Open (or create) the store under `config.data_dir`.
    ///
    /// Collection and document records are loaded into the cache and the id
    /// allocators are rebuilt from the ids in use. A fresh instance gets its
    /// root collection here.
    pub fn open(
        config: &DatabaseConfig,
        security: Arc<dyn SecurityManager>,
        txn_manager: Arc<TransactionManager>,
        hooks: HookSet,
        metrics: Arc<MetricsRegistry>,
    ) -> StorageResult<Self> {
        let dir = config.data_dir.as_path();
        fs::create_dir_all(dir)?;

        let collection_store = BTreeStore::open(dir, COLLECTIONS_FILE)?;
        let document_store = BTreeStore::open(dir, DOCUMENTS_FILE)?;
        let collections: Vec<Collection> = load_records(&collection_store)?;
        let documents: Vec<DocumentRecord> = load_records(&document_store)?;

        let collection_ids =
            IdAllocator::from_used(collections.iter().map(|c| c.id), MAX_COLLECTION_ID);
        let document_ids = IdAllocator::from_used(documents.iter().map(|d| d.id), MAX_DOCUMENT_ID);
        for doc in documents.iter().filter(|d| d.state != DocumentState::Stored && d.state != DocumentState::Updated) {
            Logger::warn(
                "DOCUMENT_INCOMPLETE_ON_OPEN",
                &[("doc", &doc.id.to_string()), ("state", &format!("{:?}", doc.state))],
            );
        }
        let collection_count = collections.len();
        let document_count = documents.len();

        let store = Self {
            data_dir: dir.to_path_buf(),
            index_depth: config.index_depth,
            lock_timeout: config.lock_timeout(),
            security,
            txn_manager,
            hooks,
            cache: Mutex::new(CollectionCache::new(
                collections,
                documents,
                collection_ids,
                document_ids,
            )),
            collection_store,
            document_store,
            node_index: BTreeStore::open(dir, NODES_FILE)?,
            dom: DomFile::open(dir)?,
            values: NativeValueIndex::open(dir, config.case_sensitive, Arc::clone(&metrics))?,
            structure: StructuralIndex::open(dir)?,
            blobs: BlobStore::new(dir),
            metrics,
            read_only: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };

        if store.cache()?.by_path(ROOT_COLLECTION).is_none() {
            if config.read_only {
                return Err(StorageError::read_only(format!(
                    "{} has no root collection",
                    dir.display()
                )));
            }
            store.create_root()?;
        }
        if config.read_only {
            store.set_read_only(true);
        }

        Logger::info(
            "NATIVE_STORE_OPENED",
            &[
                ("data_dir", &dir.display().to_string()),
                ("collections", &collection_count.to_string()),
                ("documents", &document_count.to_string()),
            ],
        );
        Ok(store)
    }

    fn create_root(&self) -> StorageResult<()> {
        let subject = Subject::system();
        self.with_txn(|_txn| {
            self.hooks
                .before_collection(|h| h.before_create(&subject, ROOT_COLLECTION))?;
            let root = {
                let mut cache = self.cache()?;
                let id = cache
                    .collection_ids
                    .allocate()
                    .ok_or_else(|| StorageError::storage("collection id space exhausted"))?;
                let root = Collection {
                    id,
                    path: ROOT_COLLECTION.to_string(),
                    parent: None,
                    permission: Permission::new(SYSTEM_USER, DBA_GROUP, 0o755),
                    created: chrono::Utc::now(),
                    children: Default::default(),
                    documents: Default::default(),
                    index_config: None,
                };
                self.persist_collection(&root)?;
                cache.put_collection(root.clone());
                root
            };
            self.metrics.increment_collections_created();
            log_event_with_fields(
                Event::CollectionCreated,
                &[("path", ROOT_COLLECTION), ("id", &root.id.to_string())],
            );
            self.hooks.after_collection(|h| h.after_create(&subject, &root));
            Ok(())
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_depth(&self) -> u32 {
        self.index_depth
    }

    pub fn value_index(&self) -> &NativeValueIndex {
        &self.values
    }

    pub fn structural_index(&self) -> &StructuralIndex {
        &self.structure
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn security(&self) -> &Arc<dyn SecurityManager> {
        &self.security
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
        for store in self.stores() {
            store.set_read_only(read_only);
        }
    }

    fn stores(&self) -> [&BTreeStore; 6] {
        [
            &self.collection_store,
            &self.document_store,
            &self.node_index,
            self.dom.store(),
            self.values.store(),
            self.structure.store(),
        ]
    }

    /// Switch the whole instance to read-only after an unrecoverable
    /// allocation failure.
    pub(crate) fn enter_read_only(&self, reason: &str) -> StorageError {
        if !self.read_only.swap(true, Ordering::SeqCst) {
            for store in self.stores() {
                store.set_read_only(true);
            }
            log_event_with_fields(Event::ReadOnlyEntered, &[("reason", reason)]);
        }
        StorageError::read_only(reason.to_string())
    }

    pub(crate) fn cache(&self) -> StorageResult<MutexGuard<'_, CollectionCache>> {
        self.cache
            .lock()
            .map_err(|_| StorageError::locking("collection cache poisoned"))
    }

    pub(crate) fn ensure_writable(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::storage("store is closed"));
        }
        if self.is_read_only() {
            return Err(StorageError::read_only("instance is read-only"));
        }
        Ok(())
    }

    /// Run `f` in a fresh transaction: commit on success, abort on error.
    pub(crate) fn with_txn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Txn) -> StorageResult<T>,
    {
        let mut txn = self.txn_manager.begin()?;
        match f(&mut txn) {
            Ok(value) => {
                self.txn_manager.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                let txn_id = txn.id().to_string();
                if let Err(abort_err) = self.txn_manager.abort(txn) {
                    Logger::error(
                        "TXN_ABORT_FAILED",
                        &[("txn", &txn_id), ("error", &abort_err.to_string())],
                    );
                }
                Logger::warn(
                    "TXN_ABORTED",
                    &[("txn", &txn_id), ("code", e.code()), ("error", &e.to_string())],
                );
                Err(e)
            }
        }
    }

    /// Lock a collection for the rest of `txn`.
    pub(crate) fn lock_collection(&self, txn: &mut Txn, id: u32, mode: LockMode) -> StorageResult<()> {
        let lock = self.cache()?.lock_for(id)?;
        txn.acquire_lock(&lock, mode, self.lock_timeout)
    }

    pub(crate) fn check(
        &self,
        subject: &Subject,
        permission: &Permission,
        bits: u16,
        resource: &str,
    ) -> StorageResult<()> {
        self.security.check(subject, permission, bits, resource)
    }

    pub(crate) fn journal(&self, txn: &Txn, record: crate::txn::JournalRecord) -> StorageResult<()> {
        self.txn_manager.write_to_log(Some(txn.id()), record)?;
        Ok(())
    }

    pub(crate) fn persist_collection(&self, collection: &Collection) -> StorageResult<()> {
        self.collection_store
            .put(id_key(collection.id), serde_json::to_vec(collection)?)
    }

    pub(crate) fn delete_collection_record(&self, id: u32) -> StorageResult<()> {
        self.collection_store.remove(&id_key(id))?;
        Ok(())
    }

    pub(crate) fn persist_document(&self, document: &DocumentRecord) -> StorageResult<()> {
        self.document_store
            .put(id_key(document.id), serde_json::to_vec(document)?)
    }

    pub(crate) fn delete_document_record(&self, id: u32) -> StorageResult<()> {
        self.document_store.remove(&id_key(id))?;
        Ok(())
    }

    /// Next document id; running out switches the instance to read-only.
    pub(crate) fn allocate_document_id(&self, cache: &mut CollectionCache) -> StorageResult<u32> {
        match cache.document_ids.allocate() {
            Some(id) => Ok(id),
            None => Err(self.enter_read_only("document id space exhausted")),
        }
    }

    /// Log an index maintenance failure and carry on. Read-only is returned.
    pub(crate) fn absorb_index_error(&self, index: &str, result: StorageResult<()>) -> StorageResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e @ StorageError::ReadOnly(_)) => Err(e),
            Err(e) => {
                Logger::error(
                    "INDEX_UPDATE_FAILED",
                    &[("index", index), ("error", &e.to_string())],
                );
                self.metrics.add_index_key_failures(1);
                Ok(())
            }
        }
    }

    pub fn get_collection(&self, path: &str) -> StorageResult<Option<Collection>> {
        let path = normalize_path(path)?;
        Ok(self.cache()?.by_path(&path).cloned())
    }

    pub fn get_document(&self, path: &str) -> StorageResult<Option<DocumentRecord>> {
        let (collection_path, name) = split_resource_path(path)?;
        let cache = self.cache()?;
        Ok(cache
            .by_path(&collection_path)
            .and_then(|c| cache.document_in(c, &name))
            .cloned())
    }

    /// Every document under `path` (recursively on request) with the qnames
    /// the effective index configurations declare.
    pub fn document_set(&self, subject: &Subject, path: &str, recursive: bool) -> StorageResult<DocumentSet> {
        let path = normalize_path(path)?;
        let cache = self.cache()?;
        let top = cache.require_path(&path)?;
        let ids = if recursive { cache.subtree(top.id)? } else { vec![top.id] };
        let mut set = DocumentSet::new();
        for id in ids {
            let collection = cache.collection(id)?;
            if !self.security.validate(subject, &collection.permission, crate::security::READ) {
                continue;
            }
            if let Some(config) = cache.effective_index_config(id) {
                for qname in config.indexed_qnames() {
                    set.add_indexed_qname(qname);
                }
            }
            for doc_id in collection.documents.values() {
                let doc = cache.document(*doc_id)?;
                if doc.is_xml() {
                    set.add(doc.id, doc.collection_id);
                }
            }
        }
        Ok(set)
    }

    /// Flush stores to disk.
    pub fn sync(&self, kind: SyncKind) -> StorageResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.values.sync()?;
        self.structure.sync()?;
        match kind {
            SyncKind::Minor => {
                self.metrics.increment_syncs_minor();
                Logger::trace("SYNC_MINOR", &[]);
            }
            SyncKind::Major => {
                self.collection_store.sync()?;
                self.document_store.sync()?;
                self.node_index.sync()?;
                self.dom.sync()?;
                self.txn_manager.flush_to_log(true, true)?;
                self.metrics.increment_syncs_major();
                log_event_with_fields(Event::SyncMajor, &[("data_dir", &self.data_dir.display().to_string())]);
            }
        }
        Ok(())
    }

    /// Final major sync; later writes fail.
    pub fn close(&self) -> StorageResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.sync(SyncKind::Major);
        self.closed.store(true, Ordering::SeqCst);
        result
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        let (collections, documents) = {
            let cache = self.cache()?;
            (cache.collection_count(), cache.document_count())
        };
        Ok(StoreStats {
            collections,
            documents,
            node_records: self.dom.store().len()?,
            value_keys: self.values.store().len()?,
            structure_keys: self.structure.store().len()?,
            read_only: self.is_read_only(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::security::UnixSecurityManager;
    use tempfile::TempDir;

    pub fn open_store(temp: &TempDir) -> NativeStore {
        open_with(temp, HookSet::new(), |_| {})
    }

    pub fn open_with(
        temp: &TempDir,
        hooks: HookSet,
        tweak: impl FnOnce(&mut DatabaseConfig),
    ) -> NativeStore {
        let mut config = DatabaseConfig::new(temp.path());
        config.lock_timeout_ms = 2_000;
        tweak(&mut config);
        let txn = Arc::new(TransactionManager::open(temp.path()).unwrap());
        NativeStore::open(
            &config,
            Arc::new(UnixSecurityManager),
            txn,
            hooks,
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    pub fn admin() -> Subject {
        Subject::new("admin", &[DBA_GROUP])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_root() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let root = store.get_collection("/db").unwrap().unwrap();
        assert!(root.is_root());
        assert_eq!(root.permission.owner, SYSTEM_USER);
    }

    #[test]
    fn test_reopen_keeps_collections() {
        let temp = TempDir::new().unwrap();
        {
            let store = open_store(&temp);
            store.get_or_create_collection(&admin(), "/db/a/b").unwrap();
            store.close().unwrap();
        }
        let store = open_store(&temp);
        assert!(store.get_collection("/db/a/b").unwrap().is_some());
        let stats = store.stats().unwrap();
        assert_eq!(stats.collections, 3);
    }

    #[test]
    fn test_closed_store_rejects_writes() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.close().unwrap();
        let err = store.get_or_create_collection(&admin(), "/db/x").unwrap_err();
        assert_eq!(err.code(), "XMLSTORE_STORAGE");
    }

    #[test]
    fn test_read_only_config_rejects_writes() {
        let temp = TempDir::new().unwrap();
        open_store(&temp).close().unwrap();
        let store = open_with(&temp, HookSet::new(), |c| c.read_only = true);
        assert!(store.is_read_only());
        let err = store.get_or_create_collection(&admin(), "/db/x").unwrap_err();
        assert!(err.is_permission_denied());
        assert!(store.get_collection("/db").unwrap().is_some());
    }

    #[test]
    fn test_enter_read_only_flags_every_store() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let err = store.enter_read_only("test");
        assert!(matches!(err, StorageError::ReadOnly(_)));
        assert!(store.stores().iter().all(|s| s.is_read_only()));
    }

    #[test]
    fn test_sync_kinds() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.sync(SyncKind::Minor).unwrap();
        store.sync(SyncKind::Major).unwrap();
        let snapshot = store.metrics.snapshot();
        assert_eq!(snapshot.syncs_minor, 1);
        assert_eq!(snapshot.syncs_major, 1);
    }
}
