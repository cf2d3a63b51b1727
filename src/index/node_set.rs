//! Query inputs and outputs: document sets and node sets

use std::collections::{BTreeMap, BTreeSet};

use crate::dom::{NodeId, QName};

/// A node reference: document plus node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeProxy {
    pub doc_id: u32,
    pub node_id: NodeId,
}

impl NodeProxy {
    pub fn new(doc_id: u32, node_id: NodeId) -> Self {
        Self { doc_id, node_id }
    }
}

/// Nodes sorted by (document, document order), without duplicates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    nodes: BTreeSet<NodeProxy>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: NodeProxy) -> bool {
        self.nodes.insert(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, doc_id: u32, node_id: &NodeId) -> bool {
        self.nodes.contains(&NodeProxy::new(doc_id, node_id.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeProxy> {
        self.nodes.iter()
    }

    pub fn contains_doc(&self, doc_id: u32) -> bool {
        self.nodes
            .range(NodeProxy::new(doc_id, NodeId::top_level(0))..)
            .next()
            .map(|n| n.doc_id == doc_id)
            .unwrap_or(false)
    }

    /// Node ids of one document, in document order
    pub fn node_ids(&self, doc_id: u32) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.doc_id == doc_id)
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// The deepest member of this set that is `node` itself or one of its
    /// ancestors. Probes each prefix of the id from the deepest up.
    pub fn nearest_ancestor_or_self(&self, doc_id: u32, node: &NodeId) -> Option<&NodeProxy> {
        let mut probe = Some(node.clone());
        while let Some(id) = probe {
            if let Some(found) = self.nodes.get(&NodeProxy::new(doc_id, id.clone())) {
                return Some(found);
            }
            probe = id.parent();
        }
        None
    }

    /// True if `node` is a member or a descendant of one.
    pub fn has_ancestor_or_self(&self, doc_id: u32, node: &NodeId) -> bool {
        self.nearest_ancestor_or_self(doc_id, node).is_some()
    }
}

impl FromIterator<NodeProxy> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeProxy>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}

/// Documents a query ranges over, with their collections and the qnames
/// those collections index.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    docs: BTreeMap<u32, u32>,
    indexed_qnames: BTreeSet<QName>,
}

impl DocumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, doc_id: u32, collection_id: u32) {
        self.docs.insert(doc_id, collection_id);
    }

    pub fn add_indexed_qname(&mut self, qname: QName) {
        self.indexed_qnames.insert(qname);
    }

    pub fn contains(&self, doc_id: u32) -> bool {
        self.docs.contains_key(&doc_id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.docs.keys().copied()
    }

    pub fn collection_ids(&self) -> BTreeSet<u32> {
        self.docs.values().copied().collect()
    }

    pub fn indexed_qnames(&self) -> impl Iterator<Item = &QName> {
        self.indexed_qnames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        s.parse().unwrap()
    }

    #[test]
    fn test_document_order_and_dedup() {
        let mut set = NodeSet::new();
        set.add(NodeProxy::new(2, id("1.1")));
        set.add(NodeProxy::new(1, id("1.2")));
        set.add(NodeProxy::new(1, id("1.1.5")));
        assert!(!set.add(NodeProxy::new(1, id("1.2"))));

        let order: Vec<String> = set.iter().map(|n| format!("{}:{}", n.doc_id, n.node_id)).collect();
        assert_eq!(order, vec!["1:1.1.5", "1:1.2", "2:1.1"]);
    }

    #[test]
    fn test_nearest_ancestor_or_self() {
        let set: NodeSet = [NodeProxy::new(1, id("1")), NodeProxy::new(1, id("1.2"))]
            .into_iter()
            .collect();
        assert_eq!(set.nearest_ancestor_or_self(1, &id("1.2.3.4")).unwrap().node_id, id("1.2"));
        assert_eq!(set.nearest_ancestor_or_self(1, &id("1.3")).unwrap().node_id, id("1"));
        assert!(set.nearest_ancestor_or_self(2, &id("1.2")).is_none());
    }

    #[test]
    fn test_contains_doc() {
        let set: NodeSet = [NodeProxy::new(4, id("1.1"))].into_iter().collect();
        assert!(set.contains_doc(4));
        assert!(!set.contains_doc(3));
        assert!(!set.contains_doc(5));
    }

    #[test]
    fn test_document_set_collections() {
        let mut docs = DocumentSet::new();
        docs.add(10, 1);
        docs.add(11, 1);
        docs.add(12, 2);
        assert_eq!(docs.collection_ids().into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(docs.contains(11));
    }
}
