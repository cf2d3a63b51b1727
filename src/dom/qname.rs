//! Qualified names

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NameKind {
    Element,
    Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    pub namespace: String,
    pub local: String,
    pub kind: NameKind,
}

impl QName {
    pub fn element(local: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            local: local.into(),
            kind: NameKind::Element,
        }
    }

    pub fn attribute(local: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            local: local.into(),
            kind: NameKind::Attribute,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn is_attribute(&self) -> bool {
        self.kind == NameKind::Attribute
    }

    /// Stable textual key: `@` for attributes, `{ns}` when namespaced
    pub fn key(&self) -> String {
        let mut out = String::new();
        if self.is_attribute() {
            out.push('@');
        }
        if !self.namespace.is_empty() {
            out.push('{');
            out.push_str(&self.namespace);
            out.push('}');
        }
        out.push_str(&self.local);
        out
    }

    /// Inverse of `key()`
    pub fn parse_key(key: &str) -> Self {
        let (kind, rest) = match key.strip_prefix('@') {
            Some(rest) => (NameKind::Attribute, rest),
            None => (NameKind::Element, key),
        };
        let (namespace, local) = match rest.strip_prefix('{').and_then(|r| r.split_once('}')) {
            Some((ns, local)) => (ns.to_string(), local.to_string()),
            None => (String::new(), rest.to_string()),
        };
        Self {
            namespace,
            local,
            kind,
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        for name in [
            QName::element("item"),
            QName::attribute("id"),
            QName::element("title").with_namespace("urn:books"),
        ] {
            assert_eq!(QName::parse_key(&name.key()), name);
        }
        assert_eq!(QName::attribute("id").key(), "@id");
    }
}
