//! Structural index: element and attribute names per document
//!
//! Key `[doc id u32 BE][qname key]`, value one segment holding every node
//! of that name in the document.

use std::collections::BTreeMap;
use std::path::Path;

use crate::btree::BTreeStore;
use crate::dom::{NodeId, NodePath, QName, StoredNode};
use crate::errors::StorageResult;

use super::node_set::{DocumentSet, NodeProxy, NodeSet};
use super::segment::{encode_segment, segments};
use super::{IndexSink, ReindexMode};

pub const FILE_NAME: &str = "structure";

fn doc_prefix(doc_id: u32) -> Vec<u8> {
    doc_id.to_be_bytes().to_vec()
}

fn name_key(doc_id: u32, qname: &QName) -> Vec<u8> {
    let mut key = doc_prefix(doc_id);
    key.extend_from_slice(qname.key().as_bytes());
    key
}

fn decode_ids(data: &[u8]) -> StorageResult<Vec<NodeId>> {
    let mut ids = Vec::new();
    for segment in segments(data) {
        ids.extend(segment?.node_ids()?);
    }
    Ok(ids)
}

pub struct StructuralIndex {
    db: BTreeStore,
}

impl StructuralIndex {
    pub fn open(dir: &Path) -> StorageResult<Self> {
        Ok(Self {
            db: BTreeStore::open(dir, FILE_NAME)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            db: BTreeStore::in_memory(FILE_NAME),
        }
    }

    pub fn store(&self) -> &BTreeStore {
        &self.db
    }

    pub fn worker(&self, doc_id: u32) -> StructuralWorker<'_> {
        StructuralWorker {
            index: self,
            doc_id,
            mode: ReindexMode::Store,
            added: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }

    /// Every element or attribute named `qname` in the document set
    pub fn find_elements_by_name(&self, docs: &DocumentSet, qname: &QName) -> StorageResult<NodeSet> {
        let mut result = NodeSet::new();
        for doc_id in docs.doc_ids() {
            if let Some(data) = self.db.get(&name_key(doc_id, qname))? {
                for node_id in decode_ids(&data)? {
                    result.add(NodeProxy::new(doc_id, node_id));
                }
            }
        }
        Ok(result)
    }

    pub fn drop_document(&self, doc_id: u32) -> StorageResult<usize> {
        self.db.remove_prefix(&doc_prefix(doc_id))
    }

    fn merge(&self, doc_id: u32, qname: &QName, add: &[NodeId], remove: &[NodeId]) -> StorageResult<()> {
        let key = name_key(doc_id, qname);
        let mut ids = match self.db.get(&key)? {
            Some(data) => decode_ids(&data)?,
            None => Vec::new(),
        };
        ids.retain(|id| !remove.contains(id));
        ids.extend_from_slice(add);
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            self.db.remove(&key)?;
        } else {
            let mut record = Vec::new();
            encode_segment(doc_id, &ids, &mut record);
            self.db.put(key, record)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<bool> {
        self.db.sync()
    }
}

pub struct StructuralWorker<'a> {
    index: &'a StructuralIndex,
    doc_id: u32,
    mode: ReindexMode,
    added: BTreeMap<QName, Vec<NodeId>>,
    removed: BTreeMap<QName, Vec<NodeId>>,
}

impl StructuralWorker<'_> {
    fn add(&mut self, node: &StoredNode) {
        if let Some(name) = node.name() {
            self.added.entry(name.clone()).or_default().push(node.node_id.clone());
        }
    }
}

impl IndexSink for StructuralWorker<'_> {
    fn name(&self) -> &'static str {
        FILE_NAME
    }

    fn set_mode(&mut self, mode: ReindexMode) {
        self.mode = mode;
    }

    fn store_element(&mut self, node: &StoredNode, _path: &NodePath, _content: &str) {
        self.add(node);
    }

    fn store_attribute(&mut self, node: &StoredNode, _path: &NodePath, _value: &str) {
        self.add(node);
    }

    fn remove_node(&mut self, node: &StoredNode, _path: &NodePath, _content: &str) {
        if let Some(name) = node.name() {
            self.removed.entry(name.clone()).or_default().push(node.node_id.clone());
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        let added = std::mem::take(&mut self.added);
        let removed = std::mem::take(&mut self.removed);
        let names: std::collections::BTreeSet<&QName> = added.keys().chain(removed.keys()).collect();
        for name in names {
            let add = added.get(name).map(Vec::as_slice).unwrap_or_default();
            let remove = removed.get(name).map(Vec::as_slice).unwrap_or_default();
            self.index.merge(self.doc_id, name, add, remove)?;
        }
        Ok(())
    }

    fn drop_document(&mut self) -> StorageResult<()> {
        self.added.clear();
        self.removed.clear();
        self.index.drop_document(self.doc_id).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{flatten, XmlNode};
    use crate::index::walk_nodes;

    #[test]
    fn test_names_recorded_per_document() {
        let index = StructuralIndex::in_memory();
        let nodes = flatten(&[XmlNode::element("book")
            .attr("id", "1")
            .text_child("title", "A")
            .text_child("title", "B")]);
        let mut worker = index.worker(3);
        walk_nodes(&nodes, ReindexMode::Store, &mut [&mut worker as &mut dyn IndexSink]);
        worker.flush().unwrap();

        let mut docs = DocumentSet::new();
        docs.add(3, 1);
        let titles = index.find_elements_by_name(&docs, &QName::element("title")).unwrap();
        assert_eq!(titles.len(), 2);
        let ids = index.find_elements_by_name(&docs, &QName::attribute("id")).unwrap();
        assert_eq!(ids.node_ids(3), vec!["1.1".parse().unwrap()]);
    }

    #[test]
    fn test_remove_mode_and_drop() {
        let index = StructuralIndex::in_memory();
        let nodes = flatten(&[XmlNode::element("a").text_child("b", "x")]);
        let mut worker = index.worker(1);
        walk_nodes(&nodes, ReindexMode::Store, &mut [&mut worker as &mut dyn IndexSink]);
        worker.flush().unwrap();

        worker.set_mode(ReindexMode::Remove);
        walk_nodes(&nodes[1..], ReindexMode::Remove, &mut [&mut worker as &mut dyn IndexSink]);
        worker.flush().unwrap();
        let mut docs = DocumentSet::new();
        docs.add(1, 1);
        assert!(index.find_elements_by_name(&docs, &QName::element("b")).unwrap().is_empty());
        assert_eq!(index.find_elements_by_name(&docs, &QName::element("a")).unwrap().len(), 1);

        worker.drop_document().unwrap();
        assert!(index.store().is_empty().unwrap());
    }
}
