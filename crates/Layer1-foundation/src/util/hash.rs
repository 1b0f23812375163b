//! Hashing and normalization utilities for cache keys

use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Compute a hash for any hashable value
pub fn compute_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Compute a hash for a JSON value
///
/// Object keys are visited in sorted order, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` hash identically.
pub fn hash_json(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_json_value(value, &mut hasher);
    hasher.finish()
}

fn hash_json_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => {
            hasher.write_u8(0);
        }
        Value::Bool(b) => {
            hasher.write_u8(1);
            b.hash(hasher);
        }
        Value::Number(n) => {
            hasher.write_u8(2);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            hasher.write_u8(3);
            s.hash(hasher);
        }
        Value::Array(arr) => {
            hasher.write_u8(4);
            hasher.write_usize(arr.len());
            for item in arr {
                hash_json_value(item, hasher);
            }
        }
        Value::Object(obj) => {
            hasher.write_u8(5);
            hasher.write_usize(obj.len());
            let mut keys: Vec<_> = obj.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(hasher);
                if let Some(v) = obj.get(key) {
                    hash_json_value(v, hasher);
                }
            }
        }
    }
}

/// Canonical form of command arguments.
///
/// String values and object keys are whitespace-trimmed and objects are
/// rebuilt with sorted keys. `null` and an empty object both normalize to an
/// empty object. Array order is preserved.
pub fn normalize_json(value: &Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => normalize_inner(other),
    }
}

fn normalize_inner(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_inner).collect()),
        Value::Object(obj) => {
            let mut entries: Vec<(String, Value)> = obj
                .iter()
                .map(|(k, v)| (k.trim().to_string(), normalize_inner(v)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        other => other.clone(),
    }
}

/// A cache key combining multiple components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    components: Vec<u64>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.components.push(compute_hash(&s));
    }

    pub fn push_json(&mut self, value: &Value) {
        self.components.push(hash_json(value));
    }

    /// Build a single hash from all components
    pub fn finalize(&self) -> u64 {
        compute_hash(&self.components)
    }
}

impl Default for CompositeKey {
    fn default() -> Self {
        Self::new()
    }
}
