//! Pluggable typed-payload serialization.
//!
//! The [`DataCodec`] trait lets components bring their own payload format
//! (JSON, protobuf, messagepack, ...) while stratus provides a default
//! [`JsonCodec`]. The negotiated format travels as a content-type string in
//! frame metadata rather than being hardcoded into the protocol.
//!
//! # Example
//!
//! ```
//! use stratus_core::{DataCodec, JsonCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Sample {
//!     id: u32,
//!     payload: String,
//! }
//!
//! let codec = JsonCodec;
//! let msg = Sample { id: 7, payload: "hello".to_string() };
//!
//! let bytes = codec.encode(&msg).expect("encode");
//! let decoded: Sample = codec.decode(&bytes).expect("decode");
//! assert_eq!(msg, decoded);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable payload serialization format.
///
/// Implementations must round-trip any serde-compatible value and report a
/// stable content type. The trait requires `Clone + Send + Sync + 'static`
/// so codec instances can be shared by channels, endpoints, and connector
/// proxies across threads.
pub trait DataCodec: Clone + Send + Sync + 'static {
    /// Stable content-type string carried in frame metadata.
    fn content_type(&self) -> &'static str;

    /// Encode a serializable value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// The default codec. Human-readable, convenient for debugging, and
/// sufficient for control-plane traffic; bulk data paths can substitute a
/// binary codec without touching the protocol layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl DataCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Inner {
        id: u32,
        label: String,
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Nested {
        outer: String,
        inner: Inner,
        blob: Vec<u8>,
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = JsonCodec;
        let msg = Inner {
            id: 42,
            label: "hello world".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: Inner = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_roundtrip_nested_with_binary() {
        let codec = JsonCodec;
        let msg = Nested {
            outer: "outer".to_string(),
            inner: Inner {
                id: 1,
                label: "inner".to_string(),
            },
            blob: vec![0, 1, 2, 255, 128],
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: Nested = codec.decode(&bytes).expect("decode should succeed");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_decode_error() {
        let codec = JsonCodec;
        let result: Result<Inner, CodecError> = codec.decode(b"not valid json {");
        let err = result.expect_err("decode should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(JsonCodec.content_type(), "application/json");
    }
}
