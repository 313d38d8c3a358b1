//! Value codecs for streams and tables.
//!
//! A codec is chosen per stream when a component is built; business logic
//! only ever sees typed values.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Bidirectional mapping between a value type and its byte representation.
///
/// # Contract
///
/// `decode(encode(v)) == v` for every valid `v`. `decode` must reject
/// malformed input with [`CodecError::Decode`] rather than panic.
pub trait Codec<T>: Send + Sync + 'static {
    /// Serialize a value.
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a value.
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// UTF-8 text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, data: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(data.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON codec for any serde type.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    /// Create a JSON codec for `T`.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
