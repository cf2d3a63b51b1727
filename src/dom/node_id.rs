//! Dynamic level numbering for stored nodes
//!
//! A NodeId is the sequence of sibling positions from the document root down
//! to the node, e.g. `1.3.2`. Properties:
//!
//! - lexicographic order over the levels is document order
//! - the parent is the id with the last level dropped
//! - the tree level is the number of levels
//! - ancestry is a prefix test, no storage lookup needed
//!
//! Two encodings:
//! - `to_bytes`: 4 bytes big-endian per level, order-preserving, used in btree keys
//! - `write_delta`/`read_delta`: prefix-compressed varints relative to the
//!   previous id of a sorted list, used in index segments

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Vec<u32>);

impl NodeId {
    /// Id of the first top-level node of a document (normally the root element)
    pub fn root() -> Self {
        NodeId(vec![1])
    }

    /// Id of the n-th (1-based) top-level node
    pub fn top_level(n: u32) -> Self {
        NodeId(vec![n])
    }

    pub fn from_levels(levels: Vec<u32>) -> StorageResult<Self> {
        if levels.is_empty() || levels.iter().any(|l| *l == 0) {
            return Err(StorageError::invalid("node id levels must be non-empty and 1-based"));
        }
        Ok(NodeId(levels))
    }

    pub fn levels(&self) -> &[u32] {
        &self.0
    }

    /// Tree level; top-level nodes are at level 1
    pub fn level(&self) -> u32 {
        self.0.len() as u32
    }

    /// The n-th (1-based) child
    pub fn new_child(&self, n: u32) -> Self {
        let mut levels = self.0.clone();
        levels.push(n);
        NodeId(levels)
    }

    pub fn first_child(&self) -> Self {
        self.new_child(1)
    }

    pub fn next_sibling(&self) -> Self {
        let mut levels = self.0.clone();
        if let Some(last) = levels.last_mut() {
            *last += 1;
        }
        NodeId(levels)
    }

    /// None for top-level nodes
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(NodeId(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Ancestor at `level`, or self when already at or above it
    pub fn ancestor_at_level(&self, level: u32) -> Self {
        let len = (level as usize).clamp(1, self.0.len());
        NodeId(self.0[..len].to_vec())
    }

    pub fn is_descendant_of(&self, other: &NodeId) -> bool {
        self.0.len() > other.0.len() && self.0.starts_with(&other.0)
    }

    pub fn is_descendant_or_self_of(&self, other: &NodeId) -> bool {
        self.0.starts_with(&other.0)
    }

    pub fn is_child_of(&self, other: &NodeId) -> bool {
        self.0.len() == other.0.len() + 1 && self.0.starts_with(&other.0)
    }

    /// Order-preserving binary form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for level in &self.0 {
            out.extend_from_slice(&level.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> StorageResult<Self> {
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(StorageError::storage(format!(
                "malformed node id of {} bytes",
                data.len()
            )));
        }
        let levels = data
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        NodeId::from_levels(levels)
    }

    /// Append this id compressed against `previous`.
    ///
    /// Layout: shared-prefix length (varint), remaining level count (varint),
    /// remaining levels (varints). Ids must be written in ascending order.
    pub fn write_delta(&self, previous: Option<&NodeId>, out: &mut Vec<u8>) {
        let shared = previous
            .map(|p| {
                p.0.iter()
                    .zip(self.0.iter())
                    .take_while(|(a, b)| a == b)
                    .count()
            })
            .unwrap_or(0);
        write_varint(out, shared as u32);
        write_varint(out, (self.0.len() - shared) as u32);
        for level in &self.0[shared..] {
            write_varint(out, *level);
        }
    }

    pub fn read_delta(previous: Option<&NodeId>, data: &[u8], pos: &mut usize) -> StorageResult<Self> {
        let shared = read_varint(data, pos)? as usize;
        let remaining = read_varint(data, pos)? as usize;
        let mut levels = match previous {
            Some(p) if shared <= p.0.len() => p.0[..shared].to_vec(),
            None if shared == 0 => Vec::with_capacity(remaining),
            _ => return Err(StorageError::storage("node id delta refers past previous id")),
        };
        for _ in 0..remaining {
            levels.push(read_varint(data, pos)?);
        }
        NodeId::from_levels(levels)
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|l| l.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl FromStr for NodeId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s
            .split('.')
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| StorageError::invalid(format!("bad node id '{}'", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        NodeId::from_levels(levels)
    }
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub(crate) fn read_varint(data: &[u8], pos: &mut usize) -> StorageResult<u32> {
    let mut result: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or_else(|| StorageError::storage("truncated varint"))?;
        *pos += 1;
        if shift > 28 {
            return Err(StorageError::storage("varint overflow"));
        }
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}
