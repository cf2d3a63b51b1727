//! Document records and their mutation lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::btree::NodeAddress;
use crate::errors::{StorageError, StorageResult};
use crate::security::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Xml,
    Binary,
}

/// `Absent` is represented by the record not existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Creating,
    Stored,
    Updated,
    Removing,
}

impl DocumentState {
    pub fn can_transition_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        matches!(
            (self, next),
            (Creating, Stored)
                | (Creating, Removing)
                | (Stored, Updated)
                | (Stored, Removing)
                | (Updated, Updated)
                | (Updated, Removing)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub mime_type: String,
    /// Bytes for binary resources, nodes for XML
    pub content_length: u64,
    /// SHA-256 of binary content
    #[serde(default)]
    pub digest: Option<String>,
}

impl DocumentMetadata {
    pub fn new(mime_type: &str) -> Self {
        let now = Utc::now();
        Self {
            created: now,
            last_modified: now,
            mime_type: mime_type.to_string(),
            content_length: 0,
            digest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: u32,
    pub collection_id: u32,
    pub name: String,
    pub resource_type: ResourceType,
    pub permission: Permission,
    pub metadata: DocumentMetadata,
    /// Raw address of the first node record (XML only)
    #[serde(default)]
    pub first_node: Option<u64>,
    pub state: DocumentState,
}

impl DocumentRecord {
    pub fn is_xml(&self) -> bool {
        self.resource_type == ResourceType::Xml
    }

    pub fn first_node_address(&self) -> Option<NodeAddress> {
        self.first_node.and_then(NodeAddress::from_raw)
    }

    pub fn transition(&mut self, next: DocumentState) -> StorageResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StorageError::storage(format!(
                "document {} cannot go from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next == DocumentState::Updated {
            self.metadata.last_modified = Utc::now();
        }
        Ok(())
    }
}
