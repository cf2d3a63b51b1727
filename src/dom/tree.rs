//! In-memory XML trees handed to the store, and their stored form
//!
//! Parsing is someone else's job: callers build `XmlNode` trees directly.
//! `flatten` assigns node ids and yields the document-order sequence of
//! `StoredNode`s that the store persists. Attributes are numbered before the
//! element's content children.

use serde::{Deserialize, Serialize};

use super::node_id::NodeId;
use super::qname::QName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element {
        name: QName,
        attributes: Vec<(QName, String)>,
        children: Vec<XmlNode>,
    },
    Text(String),
    Comment(String),
}

impl XmlNode {
    pub fn element(local: &str) -> Self {
        XmlNode::Element {
            name: QName::element(local),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn text(content: &str) -> Self {
        XmlNode::Text(content.to_string())
    }

    pub fn comment(content: &str) -> Self {
        XmlNode::Comment(content.to_string())
    }

    /// Builder: add an attribute (ignored on non-elements)
    pub fn attr(mut self, local: &str, value: &str) -> Self {
        if let XmlNode::Element { attributes, .. } = &mut self {
            attributes.push((QName::attribute(local), value.to_string()));
        }
        self
    }

    /// Builder: append a child (ignored on non-elements)
    pub fn child(mut self, node: XmlNode) -> Self {
        if let XmlNode::Element { children, .. } = &mut self {
            children.push(node);
        }
        self
    }

    /// Builder: element child containing only text
    pub fn text_child(self, local: &str, content: &str) -> Self {
        self.child(XmlNode::element(local).child(XmlNode::text(content)))
    }

    /// Concatenated descendant text
    pub fn string_value(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        match self {
            XmlNode::Element { children, .. } => children.iter().for_each(|c| c.collect_text(out)),
            XmlNode::Text(t) => out.push_str(t),
            XmlNode::Comment(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Element {
        name: QName,
        attribute_count: u32,
        child_count: u32,
    },
    Attribute {
        name: QName,
        value: String,
    },
    Text(String),
    Comment(String),
}

/// One physically stored node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNode {
    pub node_id: NodeId,
    pub kind: NodeKind,
}

impl StoredNode {
    pub fn new(node_id: NodeId, kind: NodeKind) -> Self {
        Self { node_id, kind }
    }

    pub fn is_element(&self) -> bool {
        matches!(self.kind, NodeKind::Element { .. })
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.kind, NodeKind::Attribute { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, NodeKind::Text(_))
    }

    pub fn name(&self) -> Option<&QName> {
        match &self.kind {
            NodeKind::Element { name, .. } | NodeKind::Attribute { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn level(&self) -> u32 {
        self.node_id.level()
    }
}

/// Number every node and return them in document order.
pub fn flatten(top_level: &[XmlNode]) -> Vec<StoredNode> {
    let mut out = Vec::new();
    for (i, node) in top_level.iter().enumerate() {
        flatten_node(node, NodeId::top_level(i as u32 + 1), &mut out);
    }
    out
}

fn flatten_node(node: &XmlNode, id: NodeId, out: &mut Vec<StoredNode>) {
    match node {
        XmlNode::Element {
            name,
            attributes,
            children,
        } => {
            out.push(StoredNode::new(
                id.clone(),
                NodeKind::Element {
                    name: name.clone(),
                    attribute_count: attributes.len() as u32,
                    child_count: children.len() as u32,
                },
            ));
            let mut next = 1u32;
            for (attr_name, value) in attributes {
                out.push(StoredNode::new(
                    id.new_child(next),
                    NodeKind::Attribute {
                        name: attr_name.clone(),
                        value: value.clone(),
                    },
                ));
                next += 1;
            }
            for child in children {
                flatten_node(child, id.new_child(next), out);
                next += 1;
            }
        }
        XmlNode::Text(t) => out.push(StoredNode::new(id, NodeKind::Text(t.clone()))),
        XmlNode::Comment(c) => out.push(StoredNode::new(id, NodeKind::Comment(c.clone()))),
    }
}

/// Rebuild trees from a document-order node sequence.
pub fn unflatten(nodes: &[StoredNode]) -> Vec<XmlNode> {
    let mut pos = 0;
    let mut top = Vec::new();
    while pos < nodes.len() {
        top.push(build(nodes, &mut pos));
    }
    top
}

fn build(nodes: &[StoredNode], pos: &mut usize) -> XmlNode {
    let node = &nodes[*pos];
    *pos += 1;
    match &node.kind {
        NodeKind::Element { name, .. } => {
            let mut attributes = Vec::new();
            let mut children = Vec::new();
            while *pos < nodes.len() && nodes[*pos].node_id.is_child_of(&node.node_id) {
                match &nodes[*pos].kind {
                    NodeKind::Attribute { name, value } => {
                        attributes.push((name.clone(), value.clone()));
                        *pos += 1;
                    }
                    _ => children.push(build(nodes, pos)),
                }
            }
            XmlNode::Element {
                name: name.clone(),
                attributes,
                children,
            }
        }
        NodeKind::Attribute { value, .. } => XmlNode::Text(value.clone()),
        NodeKind::Text(t) => XmlNode::Text(t.clone()),
        NodeKind::Comment(c) => XmlNode::Comment(c.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> XmlNode {
        XmlNode::element("book")
            .attr("id", "42")
            .text_child("title", "Dune")
            .child(XmlNode::comment("note"))
    }

    #[test]
    fn test_flatten_numbers_attributes_first() {
        let nodes = flatten(&[sample()]);
        let ids: Vec<String> = nodes.iter().map(|n| n.node_id.to_string()).collect();
        assert_eq!(ids, vec!["1", "1.1", "1.2", "1.2.1", "1.3"]);
        assert!(nodes[1].is_attribute());
        assert!(nodes[3].is_text());
    }

    #[test]
    fn test_unflatten_restores_tree() {
        let tree = sample();
        assert_eq!(unflatten(&flatten(&[tree.clone()])), vec![tree]);
    }

    #[test]
    fn test_string_value() {
        let tree = XmlNode::element("a")
            .text_child("b", "x")
            .child(XmlNode::text("y"))
            .child(XmlNode::comment("ignored"));
        assert_eq!(tree.string_value(), "xy");
    }
}
