//! Content hashing for change detection.
//!
//! Resources are hashed over their type and fully resolved attributes in a
//! canonical JSON form (object keys sorted at every level), so the same
//! content always yields the same hash regardless of declaration order.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Hasher for resource content and plan documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentHasher;

impl ContentHasher {
    /// Creates a new content hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the content hash of a resource from its type and resolved attributes.
    ///
    /// Attribute values that are still unknown hash as their placeholder, so a
    /// resource waiting on a computed output never matches its applied hash.
    #[must_use]
    pub fn hash_resource<T: Serialize>(&self, resource_type: &str, attributes: &BTreeMap<String, T>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_bytes(attributes));
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of any serializable document in canonical form.
    #[must_use]
    pub fn hash_document<T: Serialize>(&self, document: &T) -> String {
        hex::encode(Sha256::digest(canonical_bytes(document)))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Use constant-time comparison to avoid timing attacks
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Rebuilds a JSON value with object keys in sorted order at every level.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_value(value)
        .map(|v| canonicalize(&v).to_string().into_bytes())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ContentHasher::new();
        let a = attrs(&[("cidrBlock", json!("10.0.0.0/16")), ("tags", json!({"b": 1, "a": 2}))]);

        assert_eq!(hasher.hash_resource("aws_vpc", &a), hasher.hash_resource("aws_vpc", &a));
    }

    #[test]
    fn test_nested_key_order_ignored() {
        let hasher = ContentHasher::new();
        let a: Value = serde_json::from_str(r#"{"x": {"b": 1, "a": [ {"d": 1, "c": 2} ]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"x": {"a": [ {"c": 2, "d": 1} ], "b": 1}}"#).unwrap();
        assert_eq!(hasher.hash_document(&a), hasher.hash_document(&b));
    }

    #[test]
    fn test_type_and_attributes_both_matter() {
        let hasher = ContentHasher::new();
        let a = attrs(&[("name", json!("one"))]);
        let b = attrs(&[("name", json!("two"))]);

        assert_ne!(hasher.hash_resource("t", &a), hasher.hash_resource("t", &b));
        assert_ne!(hasher.hash_resource("t", &a), hasher.hash_resource("u", &a));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ContentHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ContentHasher::hashes_match("abc123", "abc123"));
        assert!(!ContentHasher::hashes_match("abc123", "abc124"));
        assert!(!ContentHasher::hashes_match("abc123", "abc12"));
    }
}
