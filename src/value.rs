//! Tagged value union stored by the cache and message payload helpers.
//!
//! Open (`object`-typed) data is modeled as an explicit union of the
//! accepted shapes: scalars, sequences, mappings, shared mutable nodes,
//! and serializer-captured foreign values. `Value::clone()` is shallow
//! ([`Shared`](Value::Shared) nodes keep aliasing their referent);
//! undoing that aliasing is what the deep cloner is for.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{PlinthError, PlinthResult};

/// A value of one of the shapes the foundation components accept.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent value; costs the reference width
    Null,
    /// Boolean scalar
    Bool(bool),
    /// 16-bit signed integer
    Int16(i16),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Instant in UTC
    Time(DateTime<Utc>),
    /// 16-byte identifier
    Id(Uuid),
    /// UTF-8 string
    Str(String),
    /// Raw byte buffer
    Bytes(Vec<u8>),
    /// Ordered sequence
    Seq(Vec<Value>),
    /// String-keyed mapping
    Map(BTreeMap<String, Value>),
    /// Aliasable mutable node; may form cycles
    Shared(SharedValue),
    /// Foreign value captured through the serializer
    Opaque(OpaqueValue),
}

impl Value {
    /// Wrap a value in a fresh shared node.
    pub fn shared(value: Value) -> Value {
        Value::Shared(SharedValue::new(value))
    }

    /// Numeric view used by the cache's increment and monotonic ops.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// String view; `None` for non-string shapes.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Instant view; `None` for non-time shapes.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Convert to a JSON tree. Shared nodes are inlined; cyclic values
    /// cannot be serialized and report `InvalidArgument`.
    pub fn to_json(&self) -> PlinthResult<serde_json::Value> {
        let mut visited = HashSet::new();
        self.to_json_inner(&mut visited)
    }

    fn to_json_inner(&self, visited: &mut HashSet<usize>) -> PlinthResult<serde_json::Value> {
        use serde_json::Value as Json;
        Ok(match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int16(i) => Json::from(*i),
            Value::Int32(i) => Json::from(*i),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Time(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            Value::Id(u) => Json::String(u.to_string()),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
            Value::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json_inner(visited)?);
                }
                Json::Array(out)
            }
            Value::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), value.to_json_inner(visited)?);
                }
                Json::Object(out)
            }
            Value::Shared(shared) => {
                if !visited.insert(shared.ptr_id()) {
                    return Err(PlinthError::InvalidArgument(
                        "cyclic value cannot be serialized".to_string(),
                    ));
                }
                let inner = shared.get();
                let json = inner.to_json_inner(visited)?;
                visited.remove(&shared.ptr_id());
                json
            }
            Value::Opaque(opaque) => serde_json::from_slice(opaque.bytes())
                .unwrap_or_else(|_| Json::Array(opaque.bytes().iter().map(|x| Json::from(*x)).collect())),
        })
    }

    /// Build a value from a JSON tree. Integers map to `Int`, other
    /// numbers to `Float`; objects become `Map`, arrays become `Seq`.
    pub fn from_json(json: serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::Seq(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int16(a), Value::Int16(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Id(a), Value::Id(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Shared(a), Value::Shared(b)) => a.ptr_eq(b) || a.get() == b.get(),
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Id(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// An aliasable mutable node inside a [`Value`] tree.
///
/// Cloning shares the underlying cell. Deep cloning (see the
/// `deep_clone` module) produces an independent cell, which is what the
/// cache relies on for mutation isolation.
#[derive(Debug, Clone)]
pub struct SharedValue {
    cell: Arc<Mutex<Value>>,
}

impl SharedValue {
    /// Create a shared node holding `value`.
    pub fn new(value: Value) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Snapshot the current contents (shallow clone).
    pub fn get(&self) -> Value {
        self.cell.lock().clone()
    }

    /// Replace the contents.
    pub fn set(&self, value: Value) {
        *self.cell.lock() = value;
    }

    /// Mutate the contents in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.cell.lock())
    }

    /// Whether two nodes alias the same cell.
    pub fn ptr_eq(&self, other: &SharedValue) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.cell) as usize
    }
}

/// A foreign value captured as serialized bytes plus its type name.
///
/// The size calculator costs these by serialized length, cached per
/// type name.
#[derive(Debug, Clone)]
pub struct OpaqueValue {
    type_name: String,
    bytes: Arc<[u8]>,
}

impl OpaqueValue {
    /// Capture a serializable foreign value.
    pub fn capture<T: Serialize>(value: &T) -> PlinthResult<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| PlinthError::Parse(format!("failed to capture value: {}", e)))?;
        Ok(Self {
            type_name: std::any::type_name::<T>().to_string(),
            bytes: bytes.into(),
        })
    }

    /// Construct from pre-serialized bytes.
    pub fn from_bytes(type_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            bytes: bytes.into(),
        }
    }

    /// The captured type's name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The serialized payload.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode the payload back into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> PlinthResult<T> {
        serde_json::from_slice(&self.bytes)
            .map_err(|e| PlinthError::Parse(format!("failed to decode value: {}", e)))
    }
}

impl PartialEq for OpaqueValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.bytes == other.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        let a = Value::Seq(vec![Value::from(1i64), Value::from("x")]);
        let b = Value::Seq(vec![Value::from(1i64), Value::from("x")]);
        assert_eq!(a, b);
        assert_ne!(a, Value::Seq(vec![Value::from(2i64)]));
    }

    #[test]
    fn test_shared_equality_by_contents() {
        let a = Value::shared(Value::from(7i64));
        let b = Value::shared(Value::from(7i64));
        assert_eq!(a, b);
        if let Value::Shared(cell) = &b {
            cell.set(Value::from(8i64));
        }
        assert_ne!(a, b);
    }

    #[test]
    fn test_shallow_clone_aliases_shared() {
        let original = Value::shared(Value::from(1i64));
        let copy = original.clone();
        if let Value::Shared(cell) = &copy {
            cell.set(Value::from(2i64));
        }
        // The shallow copy and the original observe the same cell.
        assert_eq!(original, Value::shared(Value::from(2i64)));
    }

    #[test]
    fn test_json_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::from(3i64));
        map.insert("s".to_string(), Value::from("text"));
        let value = Value::Map(map);
        let json = value.to_json().unwrap();
        assert_eq!(Value::from_json(json), value);
    }

    #[test]
    fn test_cyclic_value_rejected_by_to_json() {
        let shared = SharedValue::new(Value::Null);
        shared.set(Value::Seq(vec![Value::Shared(shared.clone())]));
        let cyclic = Value::Shared(shared);
        assert!(matches!(
            cyclic.to_json(),
            Err(PlinthError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_opaque_capture_and_decode() {
        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            id: u32,
            name: String,
        }
        let payload = Payload {
            id: 9,
            name: "drawing".to_string(),
        };
        let opaque = OpaqueValue::capture(&payload).unwrap();
        assert!(opaque.type_name().contains("Payload"));
        assert_eq!(opaque.decode::<Payload>().unwrap(), payload);
    }
}
