//! Node model: ids, names, trees and paths

mod node_id;
mod path;
mod qname;
mod tree;

pub use node_id::NodeId;
pub(crate) use node_id::{read_varint, write_varint};
pub use path::{NodePath, PathPattern};
pub use qname::{NameKind, QName};
pub use tree::{flatten, unflatten, NodeKind, StoredNode, XmlNode};
