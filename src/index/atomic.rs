//! Typed index values
//!
//! Node content is atomized against the index type declared in the
//! collection's index configuration. Values that cannot be represented in
//! that type are not index-capable and are skipped by the caller.
//!
//! `value_bytes` is order-preserving: comparing encodings bytewise gives the
//! same result as comparing the values, so btree range scans follow value
//! order.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    String,
    Integer,
    Double,
    Boolean,
    DateTime,
}

impl IndexType {
    /// Type byte stored in index keys
    pub fn discriminant(&self) -> u8 {
        match self {
            IndexType::String => 1,
            IndexType::Integer => 2,
            IndexType::Double => 3,
            IndexType::Boolean => 4,
            IndexType::DateTime => 5,
        }
    }

    pub fn from_discriminant(byte: u8) -> StorageResult<Self> {
        match byte {
            1 => Ok(IndexType::String),
            2 => Ok(IndexType::Integer),
            3 => Ok(IndexType::Double),
            4 => Ok(IndexType::Boolean),
            5 => Ok(IndexType::DateTime),
            other => Err(StorageError::storage(format!("unknown index type byte {}", other))),
        }
    }

    /// Accepts `string`, `xs:string`, `integer`, `xs:integer`, ...
    pub fn parse(name: &str) -> StorageResult<Self> {
        match name.trim_start_matches("xs:").to_ascii_lowercase().as_str() {
            "string" => Ok(IndexType::String),
            "integer" | "int" | "long" => Ok(IndexType::Integer),
            "double" | "decimal" | "float" => Ok(IndexType::Double),
            "boolean" => Ok(IndexType::Boolean),
            "datetime" => Ok(IndexType::DateTime),
            _ => Err(StorageError::invalid(format!("unsupported index type '{}'", name))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AtomicValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
}

impl AtomicValue {
    pub fn string(s: &str) -> Self {
        AtomicValue::String(s.to_string())
    }

    pub fn index_type(&self) -> IndexType {
        match self {
            AtomicValue::String(_) => IndexType::String,
            AtomicValue::Integer(_) => IndexType::Integer,
            AtomicValue::Double(_) => IndexType::Double,
            AtomicValue::Boolean(_) => IndexType::Boolean,
            AtomicValue::DateTime(_) => IndexType::DateTime,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AtomicValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Lowercase string values; other types are unchanged.
    pub fn fold_case(self) -> Self {
        match self {
            AtomicValue::String(s) => AtomicValue::String(s.to_lowercase()),
            other => other,
        }
    }

    pub fn value_bytes(&self) -> Vec<u8> {
        match self {
            AtomicValue::String(s) => s.as_bytes().to_vec(),
            AtomicValue::Integer(i) => order_i64(*i).to_vec(),
            AtomicValue::Double(d) => order_f64(*d).to_be_bytes().to_vec(),
            AtomicValue::Boolean(b) => vec![u8::from(*b)],
            AtomicValue::DateTime(t) => order_i64(t.timestamp_millis()).to_vec(),
        }
    }

    pub fn from_bytes(index_type: IndexType, data: &[u8]) -> StorageResult<Self> {
        let fixed8 = || -> StorageResult<[u8; 8]> {
            data.try_into()
                .map_err(|_| StorageError::storage("index value is not 8 bytes"))
        };
        Ok(match index_type {
            IndexType::String => AtomicValue::String(
                String::from_utf8(data.to_vec())
                    .map_err(|_| StorageError::storage("index string is not UTF-8"))?,
            ),
            IndexType::Integer => AtomicValue::Integer(unorder_i64(fixed8()?)),
            IndexType::Double => AtomicValue::Double(unorder_f64(u64::from_be_bytes(fixed8()?))),
            IndexType::Boolean => match data {
                [0] => AtomicValue::Boolean(false),
                [1] => AtomicValue::Boolean(true),
                _ => return Err(StorageError::storage("bad boolean index value")),
            },
            IndexType::DateTime => {
                let millis = unorder_i64(fixed8()?);
                let t = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| StorageError::storage("dateTime index value out of range"))?;
                AtomicValue::DateTime(t)
            }
        })
    }
}

/// Convert node content to the declared type.
///
/// Returns None for empty content and for content not representable in
/// `index_type`; the caller logs and skips such values.
pub fn atomize(index_type: IndexType, content: &str, case_sensitive: bool) -> Option<AtomicValue> {
    if content.is_empty() {
        return None;
    }
    let trimmed = content.trim();
    let value = match index_type {
        IndexType::String => AtomicValue::String(content.to_string()),
        IndexType::Integer => AtomicValue::Integer(trimmed.parse().ok()?),
        IndexType::Double => {
            let d: f64 = trimmed.parse().ok()?;
            if d.is_nan() {
                return None;
            }
            AtomicValue::Double(d)
        }
        IndexType::Boolean => match trimmed {
            "true" | "1" => AtomicValue::Boolean(true),
            "false" | "0" => AtomicValue::Boolean(false),
            _ => return None,
        },
        IndexType::DateTime => {
            AtomicValue::DateTime(DateTime::parse_from_rfc3339(trimmed).ok()?.with_timezone(&Utc))
        }
    };
    Some(if case_sensitive { value } else { value.fold_case() })
}

fn order_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

fn unorder_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

/// Negative floats flip every bit, positive floats flip the sign bit.
fn order_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if (bits >> 63) == 1 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

fn unorder_f64(ordered: u64) -> f64 {
    if (ordered >> 63) == 1 {
        f64::from_bits(ordered ^ (1 << 63))
    } else {
        f64::from_bits(!ordered)
    }
}

impl PartialEq for AtomicValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AtomicValue {}

impl Ord for AtomicValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index_type()
            .cmp(&other.index_type())
            .then_with(|| self.value_bytes().cmp(&other.value_bytes()))
    }
}

impl PartialOrd for AtomicValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for AtomicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomicValue::String(s) => write!(f, "{}", s),
            AtomicValue::Integer(i) => write!(f, "{}", i),
            AtomicValue::Double(d) => write!(f, "{}", d),
            AtomicValue::Boolean(b) => write!(f, "{}", b),
            AtomicValue::DateTime(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomize_integer() {
        assert_eq!(atomize(IndexType::Integer, " 42 ", true), Some(AtomicValue::Integer(42)));
        assert_eq!(atomize(IndexType::Integer, "forty-two", true), None);
        assert_eq!(atomize(IndexType::Integer, "", true), None);
    }

    #[test]
    fn test_atomize_rejects_nan_and_bad_dates() {
        assert_eq!(atomize(IndexType::Double, "NaN", true), None);
        assert_eq!(atomize(IndexType::DateTime, "yesterday", true), None);
        assert!(atomize(IndexType::DateTime, "2024-03-01T10:00:00Z", true).is_some());
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(
            atomize(IndexType::String, "Hello", false),
            Some(AtomicValue::string("hello"))
        );
        assert_eq!(
            atomize(IndexType::String, "Hello", true),
            Some(AtomicValue::string("Hello"))
        );
    }

    #[test]
    fn test_integer_bytes_sort_numerically() {
        let values = [-300i64, -1, 0, 7, 42, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                AtomicValue::Integer(pair[0]).value_bytes() < AtomicValue::Integer(pair[1]).value_bytes()
            );
        }
    }

    #[test]
    fn test_double_bytes_sort_numerically() {
        let values = [-10.5f64, -0.25, 0.0, 0.1, 3.5, 1e10];
        for pair in values.windows(2) {
            assert!(
                AtomicValue::Double(pair[0]).value_bytes() < AtomicValue::Double(pair[1]).value_bytes()
            );
        }
    }

    #[test]
    fn test_decode_matches_encode() {
        for value in [
            AtomicValue::Integer(-17),
            AtomicValue::Double(2.75),
            AtomicValue::Boolean(true),
            AtomicValue::string("abc"),
            atomize(IndexType::DateTime, "2020-01-01T00:00:00Z", true).unwrap(),
        ] {
            let decoded = AtomicValue::from_bytes(value.index_type(), &value.value_bytes()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_parse_type_names() {
        assert_eq!(IndexType::parse("xs:integer").unwrap(), IndexType::Integer);
        assert_eq!(IndexType::parse("dateTime").unwrap(), IndexType::DateTime);
        assert!(IndexType::parse("xs:duration").is_err());
    }
}
