//! Canonical binary encoding of values
//!
//! Uses bincode for fast, compact binary serialization. Determinism comes
//! from the ordered containers inside `Value`: sets and functions serialize
//! in the value total order, so one logical value always encodes to one byte
//! string. This is what makes the encoding canonical, and what the mailbox
//! wire format and receiver-side deduplication rely on.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::value::Value;

/// Error during encoding/decoding
#[derive(Debug)]
pub enum CodecError {
    /// Bincode encoding/decoding error (preserves original error for debugging)
    Bincode(Box<bincode::Error>),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Bincode(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Bincode(e) => Some(e.as_ref()),
        }
    }
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Bincode(Box::new(e))
    }
}

/// Encode a value to its canonical byte string.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a canonical byte string back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Encode any wire message that embeds values (mailbox and monitor frames).
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(message)?)
}

/// Decode a wire message.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}
