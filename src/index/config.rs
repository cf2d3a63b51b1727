//! Per-collection value index configuration
//!
//! ```json
//! {"rules": [
//!   {"target": {"path": "/test/@id"}, "type": "integer"},
//!   {"target": {"qname": "title"},     "type": "string"}
//! ]}
//! ```
//!
//! Path rules feed the generic scope: every matching node is keyed by value
//! alone. QName rules feed the qname scope: keys are partitioned by the
//! node's name. A node may match rules of both kinds.

use serde::{Deserialize, Serialize};

use crate::dom::{NodePath, PathPattern, QName};
use crate::errors::{StorageError, StorageResult};

use super::atomic::IndexType;
use super::key::IndexScope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexTarget {
    Path(PathPattern),
    /// Name in key form: `title`, `@id`, `{urn:x}title`
    QName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRule {
    pub target: IndexTarget,
    #[serde(rename = "type")]
    pub index_type: IndexType,
}

impl IndexRule {
    pub fn path(pattern: &str, index_type: IndexType) -> StorageResult<Self> {
        Ok(Self {
            target: IndexTarget::Path(PathPattern::parse(pattern)?),
            index_type,
        })
    }

    pub fn qname(qname: &QName, index_type: IndexType) -> Self {
        Self {
            target: IndexTarget::QName(qname.key()),
            index_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub rules: Vec<IndexRule>,
}

impl IndexConfig {
    pub fn new(rules: Vec<IndexRule>) -> Self {
        Self { rules }
    }

    pub fn parse(json: &str) -> StorageResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| StorageError::invalid(format!("invalid index configuration: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scopes and types under which a node at `path` named `name` is indexed.
    pub fn rules_for(&self, name: &QName, path: &NodePath) -> Vec<(IndexScope, IndexType)> {
        let mut out = Vec::new();
        for rule in &self.rules {
            match &rule.target {
                IndexTarget::Path(pattern) => {
                    if pattern.matches(path) {
                        out.push((IndexScope::Generic, rule.index_type));
                    }
                }
                IndexTarget::QName(key) => {
                    if QName::parse_key(key) == *name {
                        out.push((IndexScope::QName(name.clone()), rule.index_type));
                    }
                }
            }
        }
        out
    }

    pub fn indexed_qnames(&self) -> Vec<QName> {
        self.rules
            .iter()
            .filter_map(|r| match &r.target {
                IndexTarget::QName(key) => Some(QName::parse_key(key)),
                IndexTarget::Path(_) => None,
            })
            .collect()
    }
}
