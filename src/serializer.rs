//! Serializer capability.
//!
//! Used by the size calculator's fallback path and by out-of-process
//! cache/message-bus adapters; in-process components otherwise never
//! serialize values.

use crate::error::{PlinthError, PlinthResult};
use crate::value::Value;

/// Encodes values to bytes and back.
pub trait Serializer: Send + Sync {
    /// Serialize a value. Cyclic values are rejected.
    fn serialize(&self, value: &Value) -> PlinthResult<Vec<u8>>;

    /// Deserialize bytes produced by [`Serializer::serialize`].
    fn deserialize(&self, bytes: &[u8]) -> PlinthResult<Value>;
}

/// JSON serializer; the default for size estimation and adapters.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> PlinthResult<Vec<u8>> {
        let json = value.to_json()?;
        serde_json::to_vec(&json).map_err(|e| PlinthError::Parse(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> PlinthResult<Value> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| PlinthError::Parse(e.to_string()))?;
        Ok(Value::from_json(json))
    }
}
