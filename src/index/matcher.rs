//! String matchers for `match_values`
//!
//! A matcher decides whether an index term matches, and may narrow the key
//! range the scan has to visit by reporting a literal start term.

use regex::{Regex, RegexBuilder};

use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub enum TermMatcher {
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex {
        pattern: String,
        regex: Regex,
        case_insensitive: bool,
    },
    /// Case-folded, whitespace-normalized equality
    Collator(String),
}

impl TermMatcher {
    pub fn exact(expr: &str) -> Self {
        TermMatcher::Exact(expr.to_string())
    }

    pub fn contains(expr: &str) -> Self {
        TermMatcher::Contains(expr.to_string())
    }

    pub fn starts_with(expr: &str) -> Self {
        TermMatcher::StartsWith(expr.to_string())
    }

    pub fn ends_with(expr: &str) -> Self {
        TermMatcher::EndsWith(expr.to_string())
    }

    pub fn collator(expr: &str) -> Self {
        TermMatcher::Collator(collation_key(expr))
    }

    pub fn regex(pattern: &str, case_insensitive: bool) -> StorageResult<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| StorageError::invalid(format!("bad regex '{}': {}", pattern, e)))?;
        Ok(TermMatcher::Regex {
            pattern: pattern.to_string(),
            regex,
            case_insensitive,
        })
    }

    pub fn matches(&self, term: &str) -> bool {
        match self {
            TermMatcher::Exact(e) => term == e,
            TermMatcher::Contains(e) => term.contains(e.as_str()),
            TermMatcher::StartsWith(e) => term.starts_with(e.as_str()),
            TermMatcher::EndsWith(e) => term.ends_with(e.as_str()),
            TermMatcher::Regex { regex, .. } => regex.is_match(term),
            TermMatcher::Collator(key) => collation_key(term) == *key,
        }
    }

    /// Literal prefix every matching term must start with, if known.
    pub fn scan_start(&self) -> Option<String> {
        match self {
            TermMatcher::Exact(e) | TermMatcher::StartsWith(e) => Some(e.clone()),
            TermMatcher::Regex { pattern, .. } if !self.is_case_folding() => {
                regex_literal_prefix(pattern)
            }
            _ => None,
        }
    }

    /// Matchers that compare on folded text cannot use a byte-prefix scan.
    pub fn is_case_folding(&self) -> bool {
        match self {
            TermMatcher::Collator(_) => true,
            TermMatcher::Regex {
                case_insensitive, ..
            } => *case_insensitive,
            _ => false,
        }
    }

    /// Lowercase the expression for a case-insensitive index.
    pub fn fold_case(self) -> Self {
        match self {
            TermMatcher::Exact(e) => TermMatcher::Exact(e.to_lowercase()),
            TermMatcher::Contains(e) => TermMatcher::Contains(e.to_lowercase()),
            TermMatcher::StartsWith(e) => TermMatcher::StartsWith(e.to_lowercase()),
            TermMatcher::EndsWith(e) => TermMatcher::EndsWith(e.to_lowercase()),
            other => other,
        }
    }
}

fn collation_key(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `^abc.*` scans from `abc`. A quantifier after the run applies to its last
/// character, which is then not part of the literal prefix.
fn regex_literal_prefix(pattern: &str) -> Option<String> {
    let rest = pattern.strip_prefix('^')?;
    let run: String = rest.chars().take_while(|c| c.is_alphanumeric()).collect();
    let mut prefix = run.clone();
    if let Some(next) = rest[run.len()..].chars().next() {
        if matches!(next, '*' | '?' | '{') {
            prefix.pop();
        }
    }
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_matchers() {
        assert!(TermMatcher::exact("abc").matches("abc"));
        assert!(!TermMatcher::exact("abc").matches("abcd"));
        assert!(TermMatcher::contains("bc").matches("abcd"));
        assert!(TermMatcher::starts_with("ab").matches("abcd"));
        assert!(TermMatcher::ends_with("cd").matches("abcd"));
    }

    #[test]
    fn test_collator_ignores_case_and_spacing() {
        let m = TermMatcher::collator("Hello   World");
        assert!(m.matches("hello world"));
        assert!(m.matches(" HELLO\tworld "));
        assert!(!m.matches("hello worlds"));
    }

    #[test]
    fn test_regex_scan_start() {
        assert_eq!(TermMatcher::regex("^abc.*", false).unwrap().scan_start(), Some("abc".into()));
        assert_eq!(TermMatcher::regex("^abc*", false).unwrap().scan_start(), Some("ab".into()));
        assert_eq!(TermMatcher::regex("^a?", false).unwrap().scan_start(), None);
        assert_eq!(TermMatcher::regex("abc", false).unwrap().scan_start(), None);
    }

    #[test]
    fn test_regex_case_insensitive() {
        let m = TermMatcher::regex("^ab", true).unwrap();
        assert!(m.matches("ABC"));
    }

    #[test]
    fn test_bad_regex_rejected() {
        assert!(matches!(
            TermMatcher::regex("(", false),
            Err(StorageError::InvalidArgument(_))
        ));
    }
}
