//! Node-level access, in-place edits and reindexing
//!
//! Edits rewrite node records in the document's chain and then refresh the
//! document's index entries as a whole: the pre-edit nodes are walked in
//! `Remove` mode, the post-edit nodes in `Store` mode.

use serde::Serialize;

use crate::btree::NodeAddress;
use crate::dom::{flatten, NodeId, NodeKind, StoredNode, XmlNode};
use crate::errors::{StorageError, StorageResult};
use crate::index::{walk_nodes, IndexConfig, IndexSink, ReindexMode};
use crate::observability::{log_event_with_fields, Event, ObservationScope};
use crate::security::{Subject, READ, WRITE};
use crate::txn::LockMode;

use super::collection::{normalize_path, split_resource_path};
use super::document::{DocumentRecord, DocumentState};
use super::NativeStore;

type Located = (NodeAddress, StoredNode);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub collections: usize,
    pub documents: usize,
}

fn node_key(doc_id: u32, node_id: &NodeId) -> Vec<u8> {
    let mut key = doc_id.to_be_bytes().to_vec();
    key.extend_from_slice(&node_id.to_bytes());
    key
}

fn decode_address(raw: &[u8]) -> StorageResult<NodeAddress> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| StorageError::storage("node address must be 8 bytes"))?;
    NodeAddress::from_raw(u64::from_be_bytes(bytes))
        .ok_or_else(|| StorageError::storage("node key points at the null address"))
}

/// `id` with the component at `depth` incremented
fn shift(id: &NodeId, depth: usize) -> StorageResult<NodeId> {
    let mut levels = id.levels().to_vec();
    match levels.get_mut(depth) {
        Some(level) => *level += 1,
        None => return Err(StorageError::storage(format!("cannot shift {} at {}", id, depth))),
    }
    NodeId::from_levels(levels)
}

/// Move an id numbered from a top-level root under `root`.
fn rebase(id: &NodeId, root: &NodeId) -> StorageResult<NodeId> {
    let mut levels = root.levels().to_vec();
    levels.extend_from_slice(&id.levels()[1..]);
    NodeId::from_levels(levels)
}

fn mode_name(mode: ReindexMode) -> &'static str {
    match mode {
        ReindexMode::Store => "store",
        ReindexMode::Repair => "repair",
        ReindexMode::Remove => "remove",
    }
}

impl NativeStore {
    fn key_node(&self, doc_id: u32, node: &StoredNode, addr: NodeAddress) -> StorageResult<()> {
        if node.is_element() && node.level() <= self.index_depth {
            self.node_index
                .put(node_key(doc_id, &node.node_id), addr.raw().to_be_bytes().to_vec())?;
        }
        Ok(())
    }

    fn unkey_node(&self, doc_id: u32, node: &StoredNode) -> StorageResult<()> {
        if node.is_element() && node.level() <= self.index_depth {
            self.node_index.remove(&node_key(doc_id, &node.node_id))?;
        }
        Ok(())
    }

    /// Append `nodes` to the document's chain after `after` (or as a new
    /// chain). Returns the address of the first stored node.
    pub(crate) fn store_nodes(
        &self,
        doc: &DocumentRecord,
        nodes: &[StoredNode],
        after: Option<NodeAddress>,
    ) -> StorageResult<Option<NodeAddress>> {
        let mut prev = after;
        let mut first = None;
        for node in nodes {
            let addr = self.dom.insert_after(doc.id, prev, serde_json::to_vec(node)?)?;
            self.key_node(doc.id, node, addr)?;
            first.get_or_insert(addr);
            prev = Some(addr);
        }
        Ok(first)
    }

    fn read_located(&self, doc: &DocumentRecord) -> StorageResult<Vec<Located>> {
        let mut out = Vec::new();
        if let Some(first) = doc.first_node_address() {
            self.dom.walk(first, |addr, record| {
                out.push((addr, serde_json::from_slice(&record.payload)?));
                Ok(true)
            })?;
        }
        Ok(out)
    }

    /// Every node of an XML document in document order
    pub(crate) fn read_nodes(&self, doc: &DocumentRecord) -> StorageResult<Vec<StoredNode>> {
        Ok(self.read_located(doc)?.into_iter().map(|(_, node)| node).collect())
    }

    /// Find a node, entering the chain at its nearest keyed ancestor.
    fn locate(&self, doc: &DocumentRecord, node_id: &NodeId) -> StorageResult<Option<Located>> {
        let anchor = node_id.ancestor_at_level(node_id.level().min(self.index_depth));
        let start = match self.node_index.get(&node_key(doc.id, &anchor))? {
            Some(raw) => Some(decode_address(&raw)?),
            None => doc.first_node_address(),
        };
        let Some(start) = start else {
            return Ok(None);
        };
        let mut found = None;
        self.dom.walk(start, |addr, record| {
            let node: StoredNode = serde_json::from_slice(&record.payload)?;
            if node.node_id == *node_id {
                found = Some((addr, node));
                return Ok(false);
            }
            Ok(node.node_id < *node_id)
        })?;
        Ok(found)
    }

    /// Feed `nodes` through the value and structural indexes.
    pub(crate) fn index_document(
        &self,
        doc: &DocumentRecord,
        config: Option<IndexConfig>,
        nodes: &[StoredNode],
        mode: ReindexMode,
    ) -> StorageResult<()> {
        self.feed_sinks(doc, config, nodes, mode, false)
    }

    /// With `whole_document` the pass covers every entry of the document:
    /// Store and Repair start from an empty slate so the document keeps one
    /// segment per key, and Remove drops its whole segment under each key.
    fn feed_sinks(
        &self,
        doc: &DocumentRecord,
        config: Option<IndexConfig>,
        nodes: &[StoredNode],
        mode: ReindexMode,
        whole_document: bool,
    ) -> StorageResult<()> {
        let mut values = self.values.worker(doc.id, doc.collection_id, config);
        if whole_document && mode == ReindexMode::Remove {
            values.remove_whole_segments();
        }
        let mut structure = self.structure.worker(doc.id);
        let mut sinks: [&mut dyn IndexSink; 2] = [&mut values, &mut structure];
        let drop_first = match mode {
            ReindexMode::Repair => true,
            ReindexMode::Store => whole_document,
            ReindexMode::Remove => false,
        };
        for sink in sinks.iter_mut() {
            sink.set_mode(mode);
            if drop_first {
                let dropped = sink.drop_document();
                self.absorb_index_error(sink.name(), dropped)?;
            }
        }
        walk_nodes(nodes, mode, &mut sinks);
        for sink in sinks.iter_mut() {
            let flushed = sink.flush();
            self.absorb_index_error(sink.name(), flushed)?;
        }
        Ok(())
    }

    pub(crate) fn reindex_document(
        &self,
        doc: &DocumentRecord,
        config: Option<IndexConfig>,
        mode: ReindexMode,
    ) -> StorageResult<()> {
        let nodes = self.read_nodes(doc)?;
        self.feed_sinks(doc, config, &nodes, mode, true)
    }

    pub fn get_node(&self, subject: &Subject, doc_path: &str, node_id: &NodeId) -> StorageResult<Option<StoredNode>> {
        let doc = self
            .get_document(doc_path)?
            .ok_or_else(|| StorageError::not_found(format!("document {}", doc_path)))?;
        self.check(subject, &doc.permission, READ, doc_path)?;
        if !doc.is_xml() {
            return Err(StorageError::invalid(format!("{} is a binary resource", doc_path)));
        }
        Ok(self.locate(&doc, node_id)?.map(|(_, node)| node))
    }

    /// Shared frame of every node edit: lock, permission, hooks, then a
    /// full index refresh of the document around `edit`.
    fn edit_document<T, F>(&self, subject: &Subject, doc_path: &str, edit: F) -> StorageResult<T>
    where
        F: FnOnce(&mut DocumentRecord, &[Located]) -> StorageResult<T>,
    {
        let (collection_path, name) = split_resource_path(doc_path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let mut doc = self.locate_document(collection_id, &name, doc_path)?;
            if !doc.is_xml() {
                return Err(StorageError::invalid(format!("{} is a binary resource", doc_path)));
            }
            self.check(subject, &doc.permission, WRITE, doc_path)?;
            self.hooks.before_document(|h| h.before_update(subject, &doc))?;

            let config = self.cache()?.effective_index_config(collection_id);
            let located = self.read_located(&doc)?;
            let result = edit(&mut doc, &located)?;

            let before: Vec<StoredNode> = located.into_iter().map(|(_, node)| node).collect();
            let after = self.read_nodes(&doc)?;
            self.index_document(&doc, config.clone(), &before, ReindexMode::Remove)?;
            self.index_document(&doc, config, &after, ReindexMode::Store)?;

            doc.metadata.content_length = after.len() as u64;
            doc.transition(DocumentState::Updated)?;
            self.persist_document(&doc)?;
            self.cache()?.put_document(doc.clone());
            self.hooks.after_document(|h| h.after_update(subject, &doc));
            Ok(result)
        })
    }

    fn adjust_counts(&self, located: &[Located], parent: &NodeId, delta: i32, attribute: bool) -> StorageResult<()> {
        let Some((addr, node)) = located.iter().find(|(_, n)| n.node_id == *parent) else {
            return Ok(());
        };
        if let NodeKind::Element {
            name,
            attribute_count,
            child_count,
        } = &node.kind
        {
            let (mut attributes, mut children) = (*attribute_count, *child_count);
            if attribute {
                attributes = attributes.saturating_add_signed(delta);
            } else {
                children = children.saturating_add_signed(delta);
            }
            let updated = StoredNode::new(
                node.node_id.clone(),
                NodeKind::Element {
                    name: name.clone(),
                    attribute_count: attributes,
                    child_count: children,
                },
            );
            self.dom.update(*addr, serde_json::to_vec(&updated)?)?;
        }
        Ok(())
    }

    /// Replace a node's content in place. Element updates may rename the
    /// element; the node kind cannot change.
    pub fn update_node(&self, subject: &Subject, doc_path: &str, node: StoredNode) -> StorageResult<()> {
        self.edit_document(subject, doc_path, |_doc, located| {
            let (addr, existing) = located
                .iter()
                .find(|(_, n)| n.node_id == node.node_id)
                .ok_or_else(|| StorageError::not_found(format!("node {} in {}", node.node_id, doc_path)))?;
            let kind = match (&existing.kind, node.kind) {
                (
                    NodeKind::Element {
                        attribute_count,
                        child_count,
                        ..
                    },
                    NodeKind::Element { name, .. },
                ) => NodeKind::Element {
                    name,
                    attribute_count: *attribute_count,
                    child_count: *child_count,
                },
                (NodeKind::Attribute { .. }, kind @ NodeKind::Attribute { .. })
                | (NodeKind::Text(_), kind @ NodeKind::Text(_))
                | (NodeKind::Comment(_), kind @ NodeKind::Comment(_)) => kind,
                _ => {
                    return Err(StorageError::invalid(format!(
                        "node {} cannot change kind",
                        node.node_id
                    )))
                }
            };
            let updated = StoredNode::new(node.node_id.clone(), kind);
            self.dom.update(*addr, serde_json::to_vec(&updated)?)
        })
    }

    /// Insert `content` as the next sibling of `sibling`; returns the new
    /// node's id. Following siblings are renumbered when the id is taken.
    pub fn insert_node_after(
        &self,
        subject: &Subject,
        doc_path: &str,
        sibling: &NodeId,
        content: &XmlNode,
    ) -> StorageResult<NodeId> {
        self.edit_document(subject, doc_path, |doc, located| {
            let index = located
                .iter()
                .position(|(_, n)| n.node_id == *sibling)
                .ok_or_else(|| StorageError::not_found(format!("node {} in {}", sibling, doc_path)))?;
            if located[index].1.is_attribute() {
                return Err(StorageError::invalid(format!(
                    "cannot insert after attribute {}",
                    sibling
                )));
            }
            let end = index
                + located[index + 1..]
                    .iter()
                    .take_while(|(_, n)| n.node_id.is_descendant_of(sibling))
                    .count();
            let parent = sibling.parent();
            let new_id = sibling.next_sibling();
            let following: Vec<&Located> = located[end + 1..]
                .iter()
                .take_while(|(_, n)| match &parent {
                    Some(p) => n.node_id.is_descendant_of(p),
                    None => true,
                })
                .collect();

            if following
                .iter()
                .any(|(_, n)| n.node_id.is_descendant_or_self_of(&new_id))
            {
                let depth = sibling.levels().len() - 1;
                for (_, node) in &following {
                    self.unkey_node(doc.id, node)?;
                }
                for (addr, node) in &following {
                    let shifted = StoredNode::new(shift(&node.node_id, depth)?, node.kind.clone());
                    self.dom.update(*addr, serde_json::to_vec(&shifted)?)?;
                    self.key_node(doc.id, &shifted, *addr)?;
                }
            }

            let subtree = flatten(std::slice::from_ref(content))
                .into_iter()
                .map(|n| Ok(StoredNode::new(rebase(&n.node_id, &new_id)?, n.kind)))
                .collect::<StorageResult<Vec<_>>>()?;
            self.store_nodes(doc, &subtree, Some(located[end].0))?;
            if let Some(parent) = &parent {
                self.adjust_counts(located, parent, 1, false)?;
            }
            Ok(new_id)
        })
    }

    /// Remove a node with its descendants; returns how many records went.
    pub fn remove_node(&self, subject: &Subject, doc_path: &str, node_id: &NodeId) -> StorageResult<usize> {
        self.edit_document(subject, doc_path, |doc, located| {
            let index = located
                .iter()
                .position(|(_, n)| n.node_id == *node_id)
                .ok_or_else(|| StorageError::not_found(format!("node {} in {}", node_id, doc_path)))?;
            let count = 1 + located[index + 1..]
                .iter()
                .take_while(|(_, n)| n.node_id.is_descendant_of(node_id))
                .count();
            let removed = &located[index..index + count];
            for (addr, node) in removed {
                self.dom.remove(*addr)?;
                self.unkey_node(doc.id, node)?;
            }
            if doc.first_node == Some(removed[0].0.raw()) {
                doc.first_node = located.get(index + count).map(|(addr, _)| addr.raw());
            }
            if let Some(parent) = node_id.parent() {
                self.adjust_counts(located, &parent, -1, removed[0].1.is_attribute())?;
            }
            Ok(count)
        })
    }

    /// Rebuild (or drop) the index entries of one XML document.
    pub fn reindex_xml_resource(&self, subject: &Subject, doc_path: &str, mode: ReindexMode) -> StorageResult<()> {
        let (collection_path, name) = split_resource_path(doc_path)?;
        self.ensure_writable()?;
        self.with_txn(|txn| {
            let collection_id = self.cache()?.require_path(&collection_path)?.id;
            self.lock_collection(txn, collection_id, LockMode::Write)?;
            let doc = self.locate_document(collection_id, &name, doc_path)?;
            if !doc.is_xml() {
                return Err(StorageError::invalid(format!("{} is a binary resource", doc_path)));
            }
            self.check(subject, &doc.permission, WRITE, doc_path)?;
            let config = self.cache()?.effective_index_config(collection_id);
            self.reindex_document(&doc, config, mode)?;
            log_event_with_fields(
                Event::IndexReindex,
                &[("path", doc_path), ("mode", mode_name(mode))],
            );
            Ok(())
        })
    }

    /// Reindex every XML document under `path`, recursively.
    pub fn reindex_collection(&self, subject: &Subject, path: &str, mode: ReindexMode) -> StorageResult<ReindexReport> {
        let path = normalize_path(path)?;
        self.ensure_writable()?;
        let scope = ObservationScope::with_fields("REINDEX", &[("path", &path), ("mode", mode_name(mode))]);

        let result = self.with_txn(|txn| {
            let top = {
                let cache = self.cache()?;
                let collection = cache.require_path(&path)?;
                self.check(subject, &collection.permission, WRITE, &collection.path)?;
                collection.id
            };
            let ids = self.cache()?.subtree(top)?;
            let mut report = ReindexReport::default();
            for id in ids {
                self.lock_collection(txn, id, LockMode::Write)?;
                let (config, documents) = {
                    let cache = self.cache()?;
                    let collection = cache.collection(id)?;
                    let documents = collection
                        .documents
                        .values()
                        .map(|d| cache.document(*d).cloned())
                        .collect::<StorageResult<Vec<_>>>()?;
                    (cache.effective_index_config(id), documents)
                };
                for doc in documents.iter().filter(|d| d.is_xml()) {
                    self.reindex_document(doc, config.clone(), mode)?;
                    report.documents += 1;
                }
                report.collections += 1;
            }
            Ok(report)
        });

        match &result {
            Ok(report) => {
                log_event_with_fields(
                    Event::IndexReindex,
                    &[("path", &path), ("mode", mode_name(mode))],
                );
                scope.complete_with_fields(&[
                    ("collections", &report.collections.to_string()),
                    ("documents", &report.documents.to_string()),
                ]);
            }
            Err(e) => scope.fail(&e.to_string()),
        }
        result
    }
}
