//! Secondary indexes fed by node lifecycle events
//!
//! The storage facade drives a fixed set of sinks (value index, structural
//! index) through `walk_nodes`, which visits a document's nodes once in
//! document order and reports each element with its string value and each
//! attribute with its value.
//!
//! # Modes
//!
//! - `Store`: queue entries, `flush` appends them
//! - `Repair`: the caller drops the document's entries first, then stores
//! - `Remove`: queue removals, `flush` rewrites the affected records
//!
//! # Invariants
//!
//! - A document contributes at most one segment per value key
//! - Sinks for one document live for one operation; pending state is never
//!   shared between brokers

pub mod atomic;
pub mod config;
pub mod key;
pub mod matcher;
pub mod node_set;
pub mod segment;
pub mod structural;
pub mod value;
pub mod watchdog;

pub use atomic::{atomize, AtomicValue, IndexType};
pub use config::{IndexConfig, IndexRule, IndexTarget};
pub use key::IndexScope;
pub use matcher::TermMatcher;
pub use node_set::{DocumentSet, NodeProxy, NodeSet};
pub use structural::{StructuralIndex, StructuralWorker};
pub use value::{
    Comparison, FlushReport, NativeValueIndex, ResultAxis, ValueIndexWorker, ValueOccurrences,
};
pub use watchdog::Watchdog;

use serde::{Deserialize, Serialize};

use crate::dom::{NodeKind, NodePath, StoredNode};
use crate::errors::StorageResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexMode {
    Store,
    Repair,
    Remove,
}

/// Receiver of node events for one document
pub trait IndexSink {
    fn name(&self) -> &'static str;

    fn set_mode(&mut self, mode: ReindexMode);

    /// An element closed; `content` is its string value.
    fn store_element(&mut self, node: &StoredNode, path: &NodePath, content: &str);

    fn store_attribute(&mut self, node: &StoredNode, path: &NodePath, value: &str);

    /// Queue removal of the entries this node contributed.
    fn remove_node(&mut self, node: &StoredNode, path: &NodePath, content: &str);

    fn flush(&mut self) -> StorageResult<()>;

    /// Remove everything the current document contributed.
    fn drop_document(&mut self) -> StorageResult<()>;
}

struct OpenElement<'n> {
    node: &'n StoredNode,
    text: String,
}

fn close_element(
    element: OpenElement<'_>,
    remove: bool,
    path: &mut NodePath,
    sinks: &mut [&mut dyn IndexSink],
) {
    for sink in sinks.iter_mut() {
        if remove {
            sink.remove_node(element.node, path, &element.text);
        } else {
            sink.store_element(element.node, path, &element.text);
        }
    }
    path.pop();
}

/// Visit `nodes` (document order) once, reporting to every sink.
///
/// In `Remove` mode nodes are reported through `remove_node`, otherwise
/// through `store_element` / `store_attribute`. Paths are relative to the
/// first node's parent.
pub fn walk_nodes(nodes: &[StoredNode], mode: ReindexMode, sinks: &mut [&mut dyn IndexSink]) {
    let remove = mode == ReindexMode::Remove;
    let mut path = NodePath::new();
    let mut open: Vec<OpenElement<'_>> = Vec::new();

    for node in nodes {
        while let Some(top) = open.last() {
            if node.node_id.is_descendant_of(&top.node.node_id) {
                break;
            }
            if let Some(done) = open.pop() {
                close_element(done, remove, &mut path, sinks);
            }
        }
        match &node.kind {
            NodeKind::Element { name, .. } => {
                path.push(name.clone());
                open.push(OpenElement {
                    node,
                    text: String::new(),
                });
            }
            NodeKind::Attribute { name, value } => {
                path.push(name.clone());
                for sink in sinks.iter_mut() {
                    if remove {
                        sink.remove_node(node, &path, value);
                    } else {
                        sink.store_attribute(node, &path, value);
                    }
                }
                path.pop();
            }
            NodeKind::Text(text) => {
                for element in open.iter_mut() {
                    element.text.push_str(text);
                }
            }
            NodeKind::Comment(_) => {}
        }
    }
    while let Some(done) = open.pop() {
        close_element(done, remove, &mut path, sinks);
    }
}
