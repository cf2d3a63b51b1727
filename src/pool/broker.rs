//! Broker handle
//!
//! A broker is checked out to one thread at a time and performs every
//! storage operation on behalf of the subject on top of its subject stack.
//! Nested acquisitions push a subject, releases pop it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::dom::{NodeId, QName, StoredNode, XmlNode};
use crate::errors::{StorageError, StorageResult};
use crate::index::{AtomicValue, Comparison, IndexConfig, NodeSet, ReindexMode, ResultAxis, Watchdog};
use crate::security::Subject;
use crate::storage::{
    Collection, CollectionListing, DocumentRecord, LockedCollection, NativeStore, ReindexReport,
};
use crate::txn::LockMode;

pub struct Broker {
    id: u64,
    store: Arc<NativeStore>,
    subjects: Mutex<Vec<Subject>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("id", &self.id).finish()
    }
}

impl Broker {
    pub(crate) fn new(id: u64, store: Arc<NativeStore>) -> Self {
        Self {
            id,
            store,
            subjects: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The storage facade shared by every broker of the instance.
    pub fn store(&self) -> &NativeStore {
        &self.store
    }

    fn stack(&self) -> StorageResult<MutexGuard<'_, Vec<Subject>>> {
        self.subjects
            .lock()
            .map_err(|_| StorageError::locking("broker subject stack poisoned"))
    }

    /// Current subject; guest when nothing is pushed.
    pub fn subject(&self) -> Subject {
        self.stack()
            .ok()
            .and_then(|s| s.last().cloned())
            .unwrap_or_else(Subject::guest)
    }

    pub fn push_subject(&self, subject: Subject) -> StorageResult<()> {
        self.stack()?.push(subject);
        Ok(())
    }

    pub fn pop_subject(&self) -> StorageResult<Option<Subject>> {
        Ok(self.stack()?.pop())
    }

    pub(crate) fn reset_subjects(&self, subject: Subject) -> StorageResult<()> {
        let mut stack = self.stack()?;
        stack.clear();
        stack.push(subject);
        Ok(())
    }

    pub(crate) fn clear_subjects(&self) -> StorageResult<()> {
        self.stack()?.clear();
        Ok(())
    }

    // ---- collections ----

    pub fn get_collection(&self, path: &str) -> StorageResult<Option<Collection>> {
        self.store.get_collection(path)
    }

    pub fn get_or_create_collection(&self, path: &str) -> StorageResult<Collection> {
        self.store.get_or_create_collection(&self.subject(), path)
    }

    pub fn open_collection(&self, path: &str, mode: LockMode) -> StorageResult<LockedCollection> {
        self.store.open_collection(&self.subject(), path, mode)
    }

    pub fn list_collection(&self, path: &str) -> StorageResult<CollectionListing> {
        self.store.list_collection(&self.subject(), path)
    }

    pub fn remove_collection(&self, path: &str) -> StorageResult<()> {
        self.store.remove_collection(&self.subject(), path)
    }

    pub fn copy_collection(&self, source: &str, target_parent: &str, new_name: &str) -> StorageResult<Collection> {
        self.store.copy_collection(&self.subject(), source, target_parent, new_name)
    }

    pub fn move_collection(&self, source: &str, target_parent: &str, new_name: &str) -> StorageResult<Collection> {
        self.store.move_collection(&self.subject(), source, target_parent, new_name)
    }

    pub fn set_index_config(&self, path: &str, config: Option<IndexConfig>) -> StorageResult<()> {
        self.store.set_index_config(&self.subject(), path, config)
    }

    // ---- documents ----

    pub fn get_document(&self, path: &str) -> StorageResult<Option<DocumentRecord>> {
        self.store.get_document(path)
    }

    pub fn store_xml_resource(
        &self,
        collection_path: &str,
        name: &str,
        content: &[XmlNode],
    ) -> StorageResult<DocumentRecord> {
        self.store.store_xml_resource(&self.subject(), collection_path, name, content)
    }

    pub fn store_binary_resource(
        &self,
        collection_path: &str,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> StorageResult<DocumentRecord> {
        self.store
            .store_binary_resource(&self.subject(), collection_path, name, data, mime_type)
    }

    pub fn get_xml_resource(&self, doc_path: &str) -> StorageResult<Vec<XmlNode>> {
        self.store.get_xml_resource(&self.subject(), doc_path)
    }

    pub fn get_binary_resource(&self, doc_path: &str) -> StorageResult<Vec<u8>> {
        self.store.get_binary_resource(&self.subject(), doc_path)
    }

    pub fn remove_xml_resource(&self, doc_path: &str) -> StorageResult<()> {
        self.store.remove_xml_resource(&self.subject(), doc_path)
    }

    pub fn remove_binary_resource(&self, doc_path: &str) -> StorageResult<()> {
        self.store.remove_binary_resource(&self.subject(), doc_path)
    }

    pub fn copy_resource(&self, doc_path: &str, dest_collection: &str, new_name: &str) -> StorageResult<DocumentRecord> {
        self.store.copy_resource(&self.subject(), doc_path, dest_collection, new_name)
    }

    pub fn move_resource(&self, doc_path: &str, dest_collection: &str, new_name: &str) -> StorageResult<DocumentRecord> {
        self.store.move_resource(&self.subject(), doc_path, dest_collection, new_name)
    }

    // ---- nodes ----

    pub fn get_node(&self, doc_path: &str, node_id: &NodeId) -> StorageResult<Option<StoredNode>> {
        self.store.get_node(&self.subject(), doc_path, node_id)
    }

    pub fn update_node(&self, doc_path: &str, node: StoredNode) -> StorageResult<()> {
        self.store.update_node(&self.subject(), doc_path, node)
    }

    pub fn insert_node_after(&self, doc_path: &str, sibling: &NodeId, content: &XmlNode) -> StorageResult<NodeId> {
        self.store.insert_node_after(&self.subject(), doc_path, sibling, content)
    }

    pub fn remove_node(&self, doc_path: &str, node_id: &NodeId) -> StorageResult<usize> {
        self.store.remove_node(&self.subject(), doc_path, node_id)
    }

    // ---- indexes ----

    pub fn reindex_collection(&self, path: &str, mode: ReindexMode) -> StorageResult<ReindexReport> {
        self.store.reindex_collection(&self.subject(), path, mode)
    }

    /// Value lookup over every readable XML document below `collection_path`.
    pub fn find(
        &self,
        collection_path: &str,
        comparison: Comparison,
        qname: Option<&QName>,
        value: &AtomicValue,
    ) -> StorageResult<NodeSet> {
        let docs = self.store.document_set(&self.subject(), collection_path, true)?;
        self.store.value_index().find(
            &Watchdog::new(),
            comparison,
            &docs,
            None,
            ResultAxis::SelfNode,
            qname,
            value,
        )
    }

    /// Elements or attributes named `qname` below `collection_path`.
    pub fn find_elements(&self, collection_path: &str, qname: &QName) -> StorageResult<NodeSet> {
        let docs = self.store.document_set(&self.subject(), collection_path, true)?;
        self.store.structural_index().find_elements_by_name(&docs, qname)
    }
}
