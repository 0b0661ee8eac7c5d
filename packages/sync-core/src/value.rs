//! The `Value` type carried by every CRDT document kind.
//!
//! Mirrors a JSON-like data model (null, bool, number, string, bytes, array,
//! map) so that application payloads can be stored without the CRDT layer
//! knowing anything about domain schemas. Numbers are split into `Int`/`Float`
//! rather than collapsed into one variant so that exact integer round-trips
//! survive MessagePack encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A dynamically-typed value stored inside a CRDT document.
///
/// `Map` uses a `BTreeMap` rather than a hash map so that two replicas that
/// converge on the same keys always serialize identically, which matters for
/// content-hash based Merkle bucket comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Navigates a dot-separated path (e.g. `"address.city"`) into nested maps.
    ///
    /// Array indices are not supported by path navigation; only object field
    /// access. Returns `None` if any segment is missing or the value at that
    /// point is not a map.
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Sets a dot-separated path to `new_value`, creating intermediate maps as needed.
    ///
    /// Returns an error if an intermediate segment exists but is not a map
    /// (e.g. trying to write `"a.b"` when `a` currently holds a string).
    pub fn set_path(&mut self, path: &str, new_value: Value) -> Result<(), String> {
        let segments: Vec<&str> = path.split('.').collect();
        Self::set_path_segments(self, &segments, new_value)
    }

    fn set_path_segments(target: &mut Value, segments: &[&str], new_value: Value) -> Result<(), String> {
        let Some((head, rest)) = segments.split_first() else {
            return Err("empty path".to_string());
        };

        if !matches!(target, Value::Map(_)) {
            *target = Value::Map(BTreeMap::new());
        }
        let Value::Map(map) = target else {
            unreachable!()
        };

        if rest.is_empty() {
            map.insert((*head).to_string(), new_value);
            return Ok(());
        }

        let entry = map
            .entry((*head).to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        if !matches!(entry, Value::Map(_)) {
            return Err(format!("path segment '{head}' is not an object"));
        }
        Self::set_path_segments(entry, rest, new_value)
    }

    /// Structural equality used by the conflict detector, matching spec semantics:
    /// primitives compare by value, arrays compare elementwise (same length required),
    /// objects compare by identical key sets with elementwise-equal values, and
    /// mismatched variant types are always unequal (no numeric coercion).
    #[must_use]
    pub fn structurally_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_equal(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|bv| v.structurally_equal(bv)))
            }
            _ => false,
        }
    }

    /// Returns a short variant name for diagnostics and conflict-type classification.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
