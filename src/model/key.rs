//! Range-vector keys: immutable label sets identifying a series
//!
//! Keys are canonicalized sorted pairs so that hashing and equality are
//! O(n) over content with no per-lookup allocation.

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A mapping from label name to label value identifying one series.
///
/// Labels are held as a sorted vector of pairs; two keys are equal exactly
/// when their label sets are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeVectorKey {
    labels: Vec<(String, String)>,
}

impl RangeVectorKey {
    /// The empty key (the group key of an ungrouped aggregation)
    pub fn empty() -> Self {
        Self { labels: Vec::new() }
    }

    /// Build a key from label pairs. Pairs are sorted by name; a repeated
    /// name keeps the last value given.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut labels: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .collect();
        labels.sort_by(|a, b| a.0.cmp(&b.0));
        labels.dedup_by(|a, b| {
            if a.0 == b.0 {
                // keep the later pair's value
                b.1 = std::mem::take(&mut a.1);
                true
            } else {
                false
            }
        });
        Self { labels }
    }

    /// Look up a label value by name
    pub fn value(&self, name: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|i| self.labels[i].1.as_str())
    }

    /// Sorted label pairs
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the key has no labels
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Key restricted to the given label names (a `by (...)` clause)
    pub fn project(&self, names: &[String]) -> Self {
        let labels = self
            .labels
            .iter()
            .filter(|(n, _)| names.iter().any(|w| w == n))
            .cloned()
            .collect();
        Self { labels }
    }

    /// Key with the given label names removed (a `without (...)` clause)
    pub fn without(&self, names: &[String]) -> Self {
        let labels = self
            .labels
            .iter()
            .filter(|(n, _)| !names.iter().any(|w| w == n))
            .cloned()
            .collect();
        Self { labels }
    }

    /// Key extended with one more label; an existing label of the same name
    /// is replaced.
    pub fn with_label(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = self.labels.clone();
        let name = name.into();
        match labels.binary_search_by(|(n, _)| n.cmp(&name)) {
            Ok(i) => labels[i].1 = value.into(),
            Err(i) => labels.insert(i, (name, value.into())),
        }
        Self { labels }
    }

    /// Encode the key into a single string cell so top-k intermediates can
    /// carry series identity through rows. Round-trips via
    /// [`RangeVectorKey::from_carry_string`].
    pub fn to_carry_string(&self) -> String {
        serde_json::to_string(&self.labels).unwrap_or_default()
    }

    /// Decode a key previously encoded with
    /// [`RangeVectorKey::to_carry_string`]
    pub fn from_carry_string(s: &str) -> Result<Self> {
        let labels: Vec<(String, String)> = serde_json::from_str(s)
            .map_err(|e| QueryError::internal(format!("undecodable series key {s:?}: {e}")))?;
        Ok(Self { labels })
    }

    /// Approximate in-memory size, used for result-bytes accounting
    pub fn size_bytes(&self) -> usize {
        self.labels
            .iter()
            .map(|(n, v)| n.len() + v.len())
            .sum::<usize>()
    }
}

impl fmt::Display for RangeVectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (n, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{n}={v}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &RangeVectorKey) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_equality_is_order_independent() {
        let a = RangeVectorKey::from_pairs([("job", "api"), ("instance", "i1")]);
        let b = RangeVectorKey::from_pairs([("instance", "i1"), ("job", "api")]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_lookup_and_display() {
        let key = RangeVectorKey::from_pairs([("job", "api"), ("instance", "i1")]);
        assert_eq!(key.value("job"), Some("api"));
        assert_eq!(key.value("missing"), None);
        assert_eq!(format!("{key}"), "{instance=i1,job=api}");
    }

    #[test]
    fn test_project_and_without() {
        let key = RangeVectorKey::from_pairs([("a", "1"), ("b", "2"), ("c", "3")]);
        let by = key.project(&["b".to_string(), "c".to_string()]);
        assert_eq!(by, RangeVectorKey::from_pairs([("b", "2"), ("c", "3")]));
        let wo = key.without(&["b".to_string()]);
        assert_eq!(wo, RangeVectorKey::from_pairs([("a", "1"), ("c", "3")]));
    }

    #[test]
    fn test_carry_string_roundtrip() {
        let key = RangeVectorKey::from_pairs([("host", "a,b=c"), ("dc", "us-east")]);
        let carried = key.to_carry_string();
        let back = RangeVectorKey::from_carry_string(&carried).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_with_label_replaces() {
        let key = RangeVectorKey::from_pairs([("a", "1")]);
        let extended = key.with_label("b", "2").with_label("a", "9");
        assert_eq!(extended.value("a"), Some("9"));
        assert_eq!(extended.value("b"), Some("2"));
    }
}
