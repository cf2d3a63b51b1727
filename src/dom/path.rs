//! Node paths and the path patterns used by index configuration

use std::fmt;

use serde::{Deserialize, Serialize};

use super::qname::QName;
use crate::errors::{StorageError, StorageResult};

/// Names from the root element down to a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePath {
    steps: Vec<QName>,
}

impl NodePath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: QName) {
        self.steps.push(name);
    }

    pub fn pop(&mut self) -> Option<QName> {
        self.steps.pop()
    }

    pub fn steps(&self) -> &[QName] {
        &self.steps
    }

    pub fn last(&self) -> Option<&QName> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            write!(f, "/{}", step.key())?;
        }
        Ok(())
    }
}

/// `/a/b/@c` (anchored at the root element) or `//b/@c` (any depth)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    anchored: bool,
    steps: Vec<QName>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> StorageResult<Self> {
        let (anchored, rest) = if let Some(rest) = pattern.strip_prefix("//") {
            (false, rest)
        } else if let Some(rest) = pattern.strip_prefix('/') {
            (true, rest)
        } else {
            (false, pattern)
        };
        let steps: Vec<QName> = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .map(QName::parse_key)
            .collect();
        if steps.is_empty() {
            return Err(StorageError::invalid(format!("empty path pattern '{}'", pattern)));
        }
        if steps[..steps.len() - 1].iter().any(|s| s.is_attribute()) {
            return Err(StorageError::invalid(format!(
                "attribute step must be last in '{}'",
                pattern
            )));
        }
        Ok(Self { anchored, steps })
    }

    pub fn targets_attribute(&self) -> bool {
        self.steps.last().map(|s| s.is_attribute()).unwrap_or(false)
    }

    pub fn matches(&self, path: &NodePath) -> bool {
        let candidate = path.steps();
        if self.anchored {
            candidate == self.steps.as_slice()
        } else {
            candidate.ends_with(&self.steps)
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", if self.anchored { "/" } else { "//" })?;
        let parts: Vec<String> = self.steps.iter().map(|s| s.key()).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl TryFrom<String> for PathPattern {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PathPattern::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(value: PathPattern) -> Self {
        value.to_string()
    }
}
