//! Value index key layout
//!
//! ```text
//! generic: [collection id u32 BE][0x00]                          [type][value bytes]
//! qname:   [collection id u32 BE][0x01][len u16 BE][qname key]   [type][value bytes]
//! ```
//!
//! Every key of a collection shares the 4-byte collection prefix, which is
//! what `drop_collection` removes. The length-prefixed qname keeps keys of
//! different names from interleaving.

use crate::dom::QName;
use crate::errors::{StorageError, StorageResult};

use super::atomic::{AtomicValue, IndexType};

const SCOPE_GENERIC: u8 = 0;
const SCOPE_QNAME: u8 = 1;

/// Whether a key is shared by all paths or partitioned by node name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexScope {
    Generic,
    QName(QName),
}

impl IndexScope {
    pub fn qname(&self) -> Option<&QName> {
        match self {
            IndexScope::Generic => None,
            IndexScope::QName(q) => Some(q),
        }
    }
}

impl From<Option<&QName>> for IndexScope {
    fn from(qname: Option<&QName>) -> Self {
        match qname {
            Some(q) => IndexScope::QName(q.clone()),
            None => IndexScope::Generic,
        }
    }
}

pub fn collection_prefix(collection_id: u32) -> Vec<u8> {
    collection_id.to_be_bytes().to_vec()
}

/// Prefix covering every key of one scope and type within a collection.
pub fn typed_prefix(collection_id: u32, scope: &IndexScope, index_type: IndexType) -> Vec<u8> {
    let mut key = collection_prefix(collection_id);
    match scope {
        IndexScope::Generic => key.push(SCOPE_GENERIC),
        IndexScope::QName(qname) => {
            let name = qname.key();
            key.push(SCOPE_QNAME);
            key.extend_from_slice(&(name.len() as u16).to_be_bytes());
            key.extend_from_slice(name.as_bytes());
        }
    }
    key.push(index_type.discriminant());
    key
}

pub fn value_key(collection_id: u32, scope: &IndexScope, value: &AtomicValue) -> Vec<u8> {
    let mut key = typed_prefix(collection_id, scope, value.index_type());
    key.extend_from_slice(&value.value_bytes());
    key
}

/// A decoded index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueKey {
    pub collection_id: u32,
    pub scope: IndexScope,
    pub value: AtomicValue,
}

impl ValueKey {
    pub fn decode(key: &[u8]) -> StorageResult<Self> {
        let short = || StorageError::storage("truncated value index key");
        if key.len() < 6 {
            return Err(short());
        }
        let collection_id = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let (scope, rest) = match key[4] {
            SCOPE_GENERIC => (IndexScope::Generic, &key[5..]),
            SCOPE_QNAME => {
                if key.len() < 7 {
                    return Err(short());
                }
                let len = u16::from_be_bytes([key[5], key[6]]) as usize;
                let name = key.get(7..7 + len).ok_or_else(short)?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| StorageError::storage("qname in index key is not UTF-8"))?;
                (IndexScope::QName(QName::parse_key(name)), &key[7 + len..])
            }
            other => return Err(StorageError::storage(format!("unknown index scope byte {}", other))),
        };
        let (type_byte, value_bytes) = rest.split_first().ok_or_else(short)?;
        let value = AtomicValue::from_bytes(IndexType::from_discriminant(*type_byte)?, value_bytes)?;
        Ok(Self {
            collection_id,
            scope,
            value,
        })
    }
}
