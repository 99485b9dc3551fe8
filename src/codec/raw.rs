//! Raw payload - pass-through for binary data.
//!
//! Used with the no-op serialization when the payload is already encoded
//! by the application.
//!
//! # Example
//!
//! ```
//! use streamwire::codec::{RawPayload, Serialization, StreamMessage};
//! use bytes::Bytes;
//!
//! let bytes = Bytes::from_static(b"zero copy");
//! let encoded = RawPayload::from(bytes.clone())
//!     .encode_message(Serialization::Noop)
//!     .unwrap();
//! assert_eq!(encoded.as_ptr(), bytes.as_ptr()); // Same memory
//! ```

use bytes::Bytes;

use super::{Serialization, StreamMessage};
use crate::error::{Result, StreamwireError};

/// Opaque bytes sent without serialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPayload(pub Bytes);

impl RawPayload {
    /// Copy a slice into a payload.
    #[inline]
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for RawPayload {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawPayload {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl StreamMessage for RawPayload {
    #[inline]
    fn encode_message(&self, serialization: Serialization) -> Result<Bytes> {
        match serialization {
            Serialization::Noop => Ok(self.0.clone()),
            other => Err(StreamwireError::Encode(format!(
                "raw payload cannot be encoded as {}",
                other.as_str()
            ))),
        }
    }

    #[inline]
    fn decode_message(serialization: Serialization, data: Bytes) -> Result<Self> {
        match serialization {
            Serialization::Noop => Ok(Self(data)),
            other => Err(StreamwireError::Decode(format!(
                "raw payload cannot be decoded from {}",
                other.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_is_zero_copy() {
        let bytes = Bytes::from_static(b"test data");
        let decoded = RawPayload::decode_message(Serialization::Noop, bytes.clone()).unwrap();
        assert_eq!(decoded.as_bytes().as_ptr(), bytes.as_ptr());
    }

    #[test]
    fn test_binary_data_preserved() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        let payload = RawPayload::copy_from_slice(&all_bytes);
        let encoded = payload.encode_message(Serialization::Noop).unwrap();
        assert_eq!(&encoded[..], &all_bytes[..]);
    }

    #[test]
    fn test_other_serializations_refused() {
        let payload = RawPayload::from(&b"x"[..]);
        assert!(payload.encode_message(Serialization::Json).is_err());
        assert!(RawPayload::decode_message(Serialization::Protobuf, Bytes::from_static(b"x")).is_err());
    }
}
