//! Pluggable serialization for experiment state and timeline documents

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;

/// A serialization backend
pub trait StateSerializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError>;

    /// Name of the format, recorded next to persisted data
    fn name(&self) -> &str;
}

/// Compact binary backend
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl StateSerializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        bincode::serialize(value).map_err(|e| SerializationError::SerializationFailed {
            reason: format!("bincode encode: {}", e),
        })
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        bincode::deserialize(bytes).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("bincode decode: {}", e),
        })
    }

    fn name(&self) -> &str {
        "bincode"
    }
}

/// JSON backend, the format handed to presentation consumers
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn new_pretty() -> Self {
        Self { pretty: true }
    }

    /// Serialize straight to a string
    pub fn to_string<T: Serialize>(&self, value: &T) -> Result<String, SerializationError> {
        let result = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        result.map_err(|e| SerializationError::SerializationFailed {
            reason: format!("json encode: {}", e),
        })
    }
}

impl StateSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        self.to_string(value).map(String::into_bytes)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(bytes).map_err(|e| SerializationError::DeserializationFailed {
            reason: format!("json decode: {}", e),
        })
    }

    fn name(&self) -> &str {
        "json"
    }
}
