//! Document operations of the native store

use crate::dom::{flatten, unflatten, StoredNode, XmlNode};
use crate::errors::{StorageError, StorageResult};
use crate::index::ReindexMode;
use crate::observability::{log_event_with_fields, Event};
use crate::security::{Permission, Subject, READ, WRITE};
use crate::txn::{JournalRecord, LockMode, Txn};

use super::blob::digest;
use super::collection::{normalize_path, split_resource_path, validate_name, Collection};
use super::document::{DocumentMetadata, DocumentRecord, DocumentState, ResourceType};
use super::{id_key, NativeStore};

pub const XML_MIME: &str = "application/xml";

/// Permission for a new resource in `collection`, honouring set-gid.
fn resource_permission(subject: &Subject, collection: &Collection, mode: Option<u16>) -> Permission {
    let mut permission = Permission::resource_for(subject);
    if let Some(mode) = mode {
        permission.mode = mode;
    }
    if collection.permission.is_set_gid() {
        permission.group = collection.permission.group.clone();
    }
    permission
}

impl NativeStore {
    /// Check that `subject` may store `name` into the collection and return
    /// the collection with the document it would replace.
    fn resolve_target(
        &self,
        subject: &Subject,
        collection_id: u32,
        name: &str,
    ) -> StorageResult<(Collection, Option<DocumentRecord>)> {
        let cache = self.cache()?;
        let collection = cache.collection(collection_id)?;
        self.check(subject, &collection.permission, WRITE, &collection.path)?;
        if collection.children.contains(name) {
            return Err(StorageError::invalid(format!(
                "a collection named {} already exists in {}",
                name, collection.path
            )));
        }
        let existing = cache.document_in(collection, name).cloned();
        if let Some(existing) = &existing {
            self.check(subject, &existing.permission, WRITE, &collection.child_path(name))?;
        }
        Ok((collection.clone(), existing))
    }

    fn register_document(&self, doc: &DocumentRecord) -> StorageResult<()> {
        self.persist_document(doc)?;
        let path = {
            let mut cache = self.cache()?;
            let collection = cache.collection_mut(doc.collection_id)?;
            collection.documents.insert(doc.name.clone(), doc.id);
            let snapshot = collection.clone();
            self.persist_collection(&snapshot)?;
            cache.put_document(doc.clone());
            snapshot.child_path(&doc.name)
        };
        self.metrics.increment_documents_stored();
        log_event_with_fields(
            Event::DocumentStored,
            &[("path", &path), ("id", &doc.id.to_string())],
        );
        Ok(())
    }

    fn write_xml_document(
        &self,
        collection_id: u32,
        name: &str,
        nodes: &[StoredNode],
        permission: Permission,
    ) -> StorageResult<DocumentRecord> {
        let (id, config) = {
            let mut cache = self.cache()?;
            let id = self.allocate_document_id(&mut cache)?;
            (id, cache.effective_index_config(collection_id))
        };
        let mut doc = DocumentRecord {
            id,
            collection_id,
            name: name.to_string(),
            resource_type: ResourceType::Xml,
            permission,
            metadata: DocumentMetadata::new(XML_MIME),
            first_node: None,
            state: DocumentState::Creating,
        };
        doc.metadata.content_length = nodes.len() as u64;

        let first = match self.store_nodes(&doc, nodes, None) {
            Ok(first) => first,
            Err(e) => {
                self.cache()?.document_ids.release(id);
                return Err(e);
            }
        };
        doc.first_node = first.map(|addr| addr.raw());
        self.index_document(&doc, config, nodes, ReindexMode::Store)?;
        doc.transition(DocumentState::Stored)?;
        self.register_document(&doc)?;
        Ok(doc)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_binary_document(
        &self,
        txn: &Txn,
        collection_id: u32,
        collection_path: &str,
        name: &str,
        data: &[u8],
        mime_type: &str,
        permission: Permission,
    ) -> StorageResult<DocumentRecord> {
        let id = {
            let mut cache = self.cache()?;
            self.allocate_document_id(&mut cache)?
        };
        let content_digest = digest(data);
        self.journal(
            txn,
            JournalRecord::StoreBinary {
                path: self.blobs.file_path(collection_path, name).display().to_string(),
                digest: content_digest.clone(),
            },
        )?;
        let info = match self.blobs.write(collection_path, name, data) {
            Ok(info) => info,
            Err(e) => {
                self.cache()?.document_ids.release(id);
                return Err(e);
            }
        };

        let mut metadata = DocumentMetadata::new(mime_type);
        metadata.content_length = info.size;
        metadata.digest = Some(info.digest);
        let mut doc = DocumentRecord {
            id,
            collection_id,
            name: name.to_string(),
            resource_type: ResourceType::Binary,
            permission,
            metadata,
            first_node: None,
            state: DocumentState::Creating,
        };
        doc.transition(DocumentState::Stored)?;
        self.register_document(&doc)?;
        Ok(doc)
    }

    /// Delete a document with its nodes, index entries and content.
    ///
    /// During collection removal the collection record is dropped as a
    /// whole, value keys go with `drop_collection` and binary content moves
    /// with the directory, so those steps are skipped.
    pub(crate) fn purge_document(
        &self,
        txn: &Txn,
        doc: &DocumentRecord,
        collection_path: &str,
        collection_removal: bool,
    ) -> StorageResult<()> {
        let mut removing = doc.clone();
        removing.transition(DocumentState::Removing)?;
        self.cache()?.put_document(removing);

        match doc.resource_type {
            ResourceType::Xml => {
                if !collection_removal {
                    let dropped = self.values.drop_document(doc.collection_id, doc.id).map(|_| ());
                    self.absorb_index_error("values", dropped)?;
                }
                let dropped = self.structure.drop_document(doc.id).map(|_| ());
                self.absorb_index_error("structure", dropped)?;
                if let Some(first) = doc.first_node_address() {
                    self.dom.remove_chain(first)?;
                }
                self.node_index.remove_prefix(&id_key(doc.id))?;
            }
            ResourceType::Binary if !collection_removal => {
                self.journal(
                    txn,
                    JournalRecord::RemoveBinary {
                        path: self.blobs.file_path(collection_path, &doc.name).display().to_string(),
                    },
                )?;
                self.blobs.delete(collection_path, &doc.name)?;
            }
            ResourceType::Binary => {}
        }

        self.delete_document_record(doc.id)?;
        {
            let mut cache = self.cache()?;
            cache.remove_document(doc.id);
            cache.document_ids.release(doc.id);
            if !collection_removal {
                let collection = cache.collection_mut(doc.collection_id)?;
                collection.documents.remove(&doc.name);
                let snapshot = collection.clone();
                self.persist_collection(&snapshot)?;
            }
        }
        self.metrics.increment_documents_removed();
        log_event_with_fields(
            Event::DocumentRemoved,
            &[
                ("path", &format!("{}/{}", collection_path, doc.name)),
                ("id", &doc.id.to_string()),
            ],
        );
        Ok(())
    }

    /// Store (or replace) an XML document built from `content`.
    pub fn store_xml_resource(
        &self,
        subject: &Subject,
        collection_path: &str,
        name: &str,
        content: &[XmlNode],
    ) -> StorageResult<DocumentRecord> {
        validate_name(name)?;
        let collection_path = normalize_path(collection_path)?;
        if content.is_empty() {
            return Err(StorageError::invalid(format!("document {} has no nodes", name)));
        }
        self.ensure_writable()?;
        let nodes = flatten(content);

        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let (collection, existing) = self.resolve_target(subject, collection_id, name)?;
            let doc_path = collection.child_path(name);

            let permission = match &existing {
                Some(old) => {
                    self.hooks.before_document(|h| h.before_update(subject, old))?;
                    old.permission.clone()
                }
                None => {
                    self.hooks.before_document(|h| h.before_create(subject, &doc_path))?;
                    resource_permission(subject, &collection, None)
                }
            };
            if let Some(old) = &existing {
                self.purge_document(txn, old, &collection.path, false)?;
            }
            let doc = self.write_xml_document(collection_id, name, &nodes, permission)?;
            match existing {
                Some(_) => self.hooks.after_document(|h| h.after_update(subject, &doc)),
                None => self.hooks.after_document(|h| h.after_create(subject, &doc)),
            }
            Ok(doc)
        })
    }

    /// Store (or replace) a binary document.
    pub fn store_binary_resource(
        &self,
        subject: &Subject,
        collection_path: &str,
        name: &str,
        data: &[u8],
        mime_type: &str,
    ) -> StorageResult<DocumentRecord> {
        validate_name(name)?;
        let collection_path = normalize_path(collection_path)?;
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let (collection, existing) = self.resolve_target(subject, collection_id, name)?;
            let doc_path = collection.child_path(name);

            let permission = match &existing {
                Some(old) => {
                    self.hooks.before_document(|h| h.before_update(subject, old))?;
                    old.permission.clone()
                }
                None => {
                    self.hooks.before_document(|h| h.before_create(subject, &doc_path))?;
                    resource_permission(subject, &collection, None)
                }
            };
            if let Some(old) = &existing {
                self.purge_document(txn, old, &collection.path, false)?;
            }
            let doc = self.write_binary_document(
                txn,
                collection_id,
                &collection.path,
                name,
                data,
                mime_type,
                permission,
            )?;
            match existing {
                Some(_) => self.hooks.after_document(|h| h.after_update(subject, &doc)),
                None => self.hooks.after_document(|h| h.after_create(subject, &doc)),
            }
            Ok(doc)
        })
    }

    /// Re-serialize `doc` into a new document `name` of another collection.
    pub(crate) fn copy_document_into(
        &self,
        txn: &Txn,
        subject: &Subject,
        doc: &DocumentRecord,
        source_collection: &str,
        dest_collection_id: u32,
        name: &str,
    ) -> StorageResult<DocumentRecord> {
        let dest = self.cache()?.collection(dest_collection_id)?.clone();
        let permission = resource_permission(subject, &dest, Some(doc.permission.mode));
        match doc.resource_type {
            ResourceType::Xml => {
                let nodes = self.read_nodes(doc)?;
                self.write_xml_document(dest_collection_id, name, &nodes, permission)
            }
            ResourceType::Binary => {
                let data = self.blobs.read(source_collection, &doc.name)?;
                self.write_binary_document(
                    txn,
                    dest_collection_id,
                    &dest.path,
                    name,
                    &data,
                    &doc.metadata.mime_type,
                    permission,
                )
            }
        }
    }

    pub(crate) fn locate_document(&self, collection_id: u32, name: &str, path: &str) -> StorageResult<DocumentRecord> {
        let cache = self.cache()?;
        let collection = cache.collection(collection_id)?;
        cache
            .document_in(collection, name)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("document {}", path)))
    }

    /// Copy a document to `dest_collection/new_name` under a fresh id.
    pub fn copy_resource(
        &self,
        subject: &Subject,
        doc_path: &str,
        dest_collection: &str,
        new_name: &str,
    ) -> StorageResult<DocumentRecord> {
        validate_name(new_name)?;
        let (source_collection, source_name) = split_resource_path(doc_path)?;
        let dest_collection = normalize_path(dest_collection)?;
        if source_collection == dest_collection && source_name == new_name {
            return Err(StorageError::invalid(format!("cannot copy {} onto itself", doc_path)));
        }
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let (source_id, dest_id) = {
                let cache = self.cache()?;
                (
                    cache.require_path(&source_collection)?.id,
                    cache.require_path(&dest_collection)?.id,
                )
            };
            self.lock_collection(txn, source_id, LockMode::Read)?;
            self.lock_collection(txn, dest_id, LockMode::Write)?;

            let source_path = format!("{}/{}", source_collection, source_name);
            let doc = self.locate_document(source_id, &source_name, &source_path)?;
            self.check(subject, &doc.permission, READ, &source_path)?;
            let (dest, existing) = self.resolve_target(subject, dest_id, new_name)?;
            let target_path = dest.child_path(new_name);

            self.hooks
                .before_document(|h| h.before_copy(subject, &doc, &target_path))?;
            if let Some(old) = &existing {
                self.purge_document(txn, old, &dest.path, false)?;
            }
            let copy = self.copy_document_into(txn, subject, &doc, &source_collection, dest_id, new_name)?;
            self.hooks
                .after_document(|h| h.after_copy(subject, &source_path, &copy));
            Ok(copy)
        })
    }

    /// Move a document, keeping its id. Moving across collections reindexes
    /// its values under the new collection.
    pub fn move_resource(
        &self,
        subject: &Subject,
        doc_path: &str,
        dest_collection: &str,
        new_name: &str,
    ) -> StorageResult<DocumentRecord> {
        validate_name(new_name)?;
        let (source_collection, source_name) = split_resource_path(doc_path)?;
        let dest_collection = normalize_path(dest_collection)?;
        if source_collection == dest_collection && source_name == new_name {
            return Err(StorageError::invalid(format!("cannot move {} onto itself", doc_path)));
        }
        self.ensure_writable()?;

        self.with_txn(|txn| {
            let (source_id, dest_id) = {
                let cache = self.cache()?;
                (
                    cache.require_path(&source_collection)?.id,
                    cache.require_path(&dest_collection)?.id,
                )
            };
            self.lock_collection(txn, source_id, LockMode::Write)?;
            self.lock_collection(txn, dest_id, LockMode::Write)?;

            let source_path = format!("{}/{}", source_collection, source_name);
            let doc = self.locate_document(source_id, &source_name, &source_path)?;
            {
                let cache = self.cache()?;
                let source = cache.collection(source_id)?;
                self.check(subject, &source.permission, WRITE, &source.path)?;
            }
            let (dest, existing) = self.resolve_target(subject, dest_id, new_name)?;
            let target_path = dest.child_path(new_name);

            self.hooks
                .before_document(|h| h.before_move(subject, &doc, &target_path))?;
            if let Some(old) = &existing {
                self.purge_document(txn, old, &dest.path, false)?;
            }

            if doc.resource_type == ResourceType::Binary {
                self.journal(
                    txn,
                    JournalRecord::RenameBinary {
                        from: self.blobs.file_path(&source_collection, &source_name).display().to_string(),
                        to: self.blobs.file_path(&dest.path, new_name).display().to_string(),
                    },
                )?;
                self.blobs
                    .rename_file(&source_collection, &source_name, &dest.path, new_name)?;
            }

            let (moved, old_config, new_config) = {
                let mut cache = self.cache()?;
                let old_config = cache.effective_index_config(source_id);
                let new_config = cache.effective_index_config(dest_id);

                let source = cache.collection_mut(source_id)?;
                source.documents.remove(&source_name);
                let snapshot = source.clone();
                self.persist_collection(&snapshot)?;

                let dest = cache.collection_mut(dest_id)?;
                dest.documents.insert(new_name.to_string(), doc.id);
                let snapshot = dest.clone();
                self.persist_collection(&snapshot)?;

                let record = cache.document_mut(doc.id)?;
                record.collection_id = dest_id;
                record.name = new_name.to_string();
                let moved = record.clone();
                self.persist_document(&moved)?;
                (moved, old_config, new_config)
            };

            if moved.is_xml() && (source_id != dest_id || old_config != new_config) {
                let dropped = self.values.drop_document(source_id, doc.id).map(|_| ());
                self.absorb_index_error("values", dropped)?;
                self.reindex_document(&moved, new_config, ReindexMode::Repair)?;
            }
            self.hooks
                .after_document(|h| h.after_move(subject, &source_path, &moved));
            Ok(moved)
        })
    }

    fn remove_resource(&self, subject: &Subject, doc_path: &str, expected: ResourceType) -> StorageResult<()> {
        let (collection_path, name) = split_resource_path(doc_path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let doc = self.locate_document(collection_id, &name, doc_path)?;
            if doc.resource_type != expected {
                return Err(StorageError::invalid(format!(
                    "{} is not a {:?} resource",
                    doc_path, expected
                )));
            }
            {
                let cache = self.cache()?;
                let collection = cache.collection(collection_id)?;
                self.check(subject, &collection.permission, WRITE, &collection.path)?;
            }
            self.hooks.before_document(|h| h.before_delete(subject, &doc))?;
            self.purge_document(txn, &doc, &collection_path, false)?;
            let removed_path = format!("{}/{}", collection_path, name);
            self.hooks
                .after_document(|h| h.after_delete(subject, &removed_path));
            Ok(())
        })
    }

    pub fn remove_xml_resource(&self, subject: &Subject, doc_path: &str) -> StorageResult<()> {
        self.remove_resource(subject, doc_path, ResourceType::Xml)
    }

    pub fn remove_binary_resource(&self, subject: &Subject, doc_path: &str) -> StorageResult<()> {
        self.remove_resource(subject, doc_path, ResourceType::Binary)
    }

    fn readable_document(&self, subject: &Subject, doc_path: &str) -> StorageResult<DocumentRecord> {
        let doc = self
            .get_document(doc_path)?
            .ok_or_else(|| StorageError::not_found(format!("document {}", doc_path)))?;
        self.check(subject, &doc.permission, READ, doc_path)?;
        Ok(doc)
    }

    /// The document's tree, rebuilt from its stored nodes.
    pub fn get_xml_resource(&self, subject: &Subject, doc_path: &str) -> StorageResult<Vec<XmlNode>> {
        let doc = self.readable_document(subject, doc_path)?;
        if !doc.is_xml() {
            return Err(StorageError::invalid(format!("{} is a binary resource", doc_path)));
        }
        Ok(unflatten(&self.read_nodes(&doc)?))
    }

    /// Binary content, verified against the stored digest.
    pub fn get_binary_resource(&self, subject: &Subject, doc_path: &str) -> StorageResult<Vec<u8>> {
        let doc = self.readable_document(subject, doc_path)?;
        if doc.is_xml() {
            return Err(StorageError::invalid(format!("{} is an XML resource", doc_path)));
        }
        let (collection_path, name) = split_resource_path(doc_path)?;
        let data = self.blobs.read(&collection_path, &name)?;
        if let Some(expected) = &doc.metadata.digest {
            if digest(&data) != *expected {
                return Err(StorageError::storage(format!("digest mismatch for {}", doc_path)));
            }
        }
        Ok(data)
    }

    /// Replace a document's permission; owner or admin only.
    pub fn set_document_permission(
        &self,
        subject: &Subject,
        doc_path: &str,
        permission: Permission,
    ) -> StorageResult<()> {
        let (collection_path, name) = split_resource_path(doc_path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let doc = self.locate_document(collection_id, &name, doc_path)?;
            if doc.permission.owner != subject.name() && !self.security.has_admin_role(subject) {
                return Err(StorageError::permission_denied(format!(
                    "{} does not own {}",
                    subject.name(),
                    doc_path
                )));
            }
            let mut cache = self.cache()?;
            let record = cache.document_mut(doc.id)?;
            record.permission = permission;
            let snapshot = record.clone();
            self.persist_document(&snapshot)
        })
    }
}
