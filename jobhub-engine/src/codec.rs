//! Serialization of parsed arguments into the instance's `args` column.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("argument codec error: {0}")]
pub struct CodecError(pub String);

/// Turns parsed arguments into the persisted string form and back.
///
/// Whatever `encode` produces, `decode` must accept verbatim: reruns copy the
/// stored string without re-parsing.
pub trait ArgsCodec: Send + Sync + fmt::Debug {
    fn encode(&self, value: &Value) -> Result<String, CodecError>;
    fn decode(&self, raw: &str) -> Result<Value, CodecError>;
}

/// Stores arguments as compact JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ArgsCodec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError(e.to_string()))
    }
}
