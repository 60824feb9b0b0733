//! Pluggable body serialization.
//!
//! The runtime routes on message headers and never interprets bodies; the
//! [`MessageCodec`] decides how invokable payloads and responses are
//! encoded. [`JsonCodec`] is the default — human-readable and dependency
//! free beyond serde. Bring your own codec for denser formats.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable serialization format for message bodies.
///
/// `Clone + Send + Sync + 'static` so one codec instance can be shared by
/// the router, every activation dispatcher, and the connection manager.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json — the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let value = Sample {
            id: 7,
            name: "seven".to_string(),
        };
        let bytes = codec.encode(&value).expect("encode");
        let back: Sample = codec.decode(&bytes).expect("decode");
        assert_eq!(value, back);
    }

    #[test]
    fn test_decode_error_is_reported() {
        let codec = JsonCodec;
        let result: Result<Sample, _> = codec.decode(b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
