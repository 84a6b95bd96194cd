//! Typed values of the key-value metadata store.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declared type of a stored metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvType {
    /// 64-bit signed integer.
    Integer,
    /// Floating point number.
    Number,
    /// `true` or `false`.
    Bool,
    /// Free text.
    String,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl KvType {
    /// Returns the persisted type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KvType::Integer => "integer",
            KvType::Number => "number",
            KvType::Bool => "bool",
            KvType::String => "string",
            KvType::Object => "object",
            KvType::Array => "array",
        }
    }
}

impl fmt::Display for KvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "integer" => Ok(KvType::Integer),
            "number" => Ok(KvType::Number),
            "bool" | "boolean" => Ok(KvType::Bool),
            "string" => Ok(KvType::String),
            "object" => Ok(KvType::Object),
            "array" => Ok(KvType::Array),
            other => Err(ProtocolError::UnknownKvType(other.to_string())),
        }
    }
}

/// A decoded metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    /// Integer value.
    Integer(i64),
    /// Number value.
    Number(f64),
    /// Boolean value.
    Bool(bool),
    /// Text value.
    String(String),
    /// JSON object.
    Object(serde_json::Value),
    /// JSON array.
    Array(serde_json::Value),
}

impl KvValue {
    /// The declared type of this value.
    pub fn kv_type(&self) -> KvType {
        match self {
            KvValue::Integer(_) => KvType::Integer,
            KvValue::Number(_) => KvType::Number,
            KvValue::Bool(_) => KvType::Bool,
            KvValue::String(_) => KvType::String,
            KvValue::Object(_) => KvType::Object,
            KvValue::Array(_) => KvType::Array,
        }
    }

    /// Encodes the value into its stored string form.
    pub fn encode(&self) -> String {
        match self {
            KvValue::Integer(v) => v.to_string(),
            KvValue::Number(v) => v.to_string(),
            KvValue::Bool(v) => v.to_string(),
            KvValue::String(v) => v.clone(),
            KvValue::Object(v) | KvValue::Array(v) => v.to_string(),
        }
    }

    /// Decodes a stored string according to its declared type.
    pub fn decode(kind: KvType, raw: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidKvValue {
            kind: kind.as_str(),
            value: raw.to_string(),
        };
        match kind {
            KvType::Integer => raw.trim().parse().map(KvValue::Integer).map_err(|_| invalid()),
            KvType::Number => raw.trim().parse().map(KvValue::Number).map_err(|_| invalid()),
            KvType::Bool => match raw.trim() {
                "true" => Ok(KvValue::Bool(true)),
                "false" => Ok(KvValue::Bool(false)),
                _ => Err(invalid()),
            },
            KvType::String => Ok(KvValue::String(raw.to_string())),
            KvType::Object => match serde_json::from_str(raw) {
                Ok(v @ serde_json::Value::Object(_)) => Ok(KvValue::Object(v)),
                _ => Err(invalid()),
            },
            KvType::Array => match serde_json::from_str(raw) {
                Ok(v @ serde_json::Value::Array(_)) => Ok(KvValue::Array(v)),
                _ => Err(invalid()),
            },
        }
    }
}
