//! Codec module - serialization and compression of DATA payloads.
//!
//! - [`SerializationRegistry`] / [`StreamMessage`] - protobuf, JSON, no-op
//! - [`CompressionRegistry`] / [`Compressor`] - identity, gzip, zlib
//! - [`NegotiatedCodec`] - the pair fixed for one stream by its INIT exchange
//!
//! # Example
//!
//! ```
//! use streamwire::codec::{CodecRegistry, NegotiatedCodec, RawPayload};
//! use bytes::Bytes;
//!
//! let registry = CodecRegistry::default();
//! // no-op serialization, gzip compression
//! let codec = NegotiatedCodec::resolve(4, 1, &registry).unwrap();
//!
//! let wire = codec.encode(&RawPayload::from(&b"hello"[..])).unwrap();
//! let back: RawPayload = codec.decode(wire).unwrap();
//! assert_eq!(back.as_bytes(), b"hello");
//! ```

mod compression;
mod raw;
mod serialization;

pub use compression::{
    BoxedCompressor, CompressionRegistry, Compressor, Gzip, Identity, Zlib, DEFAULT_LEVEL,
    DEFAULT_MAX_DECOMPRESSED_SIZE, GZIP, IDENTITY, ZLIB,
};
pub use raw::RawPayload;
pub use serialization::{Serialization, SerializationRegistry, StreamMessage};

use bytes::Bytes;

use crate::error::{Result, StreamwireError};

/// Both registries, built once and shared by every stream of a connection.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    pub serialization: SerializationRegistry,
    pub compression: CompressionRegistry,
}

/// Serialization and compression fixed for one stream.
///
/// Immutable once built; a stream keeps the same instance for its whole
/// lifetime.
#[derive(Debug, Clone)]
pub struct NegotiatedCodec {
    serialization: Serialization,
    content_encoding: i32,
    compressor: BoxedCompressor,
}

impl NegotiatedCodec {
    /// Resolve both codes strictly. Fails if either is not registered.
    pub fn resolve(content_type: i32, content_encoding: i32, registry: &CodecRegistry) -> Result<Self> {
        let serialization = registry.serialization.lookup(content_type)?;
        let compressor = registry.compression.lookup(content_encoding)?.clone();
        Ok(Self {
            serialization,
            content_encoding,
            compressor,
        })
    }

    /// Responder-side negotiation of an initiator's proposal.
    ///
    /// The proposed serialization must be registered. An unregistered
    /// compression falls back to identity.
    pub fn negotiate(
        proposed_type: i32,
        proposed_encoding: i32,
        registry: &CodecRegistry,
    ) -> Result<Self> {
        match Self::resolve(proposed_type, proposed_encoding, registry) {
            Err(StreamwireError::UnsupportedCompression(_)) => {
                tracing::debug!(
                    proposed_encoding,
                    "compression not registered, falling back to identity"
                );
                Self::resolve(proposed_type, IDENTITY, registry)
            }
            other => other,
        }
    }

    #[inline]
    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    /// `content_type` code.
    #[inline]
    pub fn content_type(&self) -> i32 {
        self.serialization.code()
    }

    /// `content_encoding` code.
    #[inline]
    pub fn content_encoding(&self) -> i32 {
        self.content_encoding
    }

    /// Serialize, then compress.
    pub fn encode<M: StreamMessage>(&self, message: &M) -> Result<Bytes> {
        let serialized = message.encode_message(self.serialization)?;
        self.compressor.compress(serialized).map_err(|e| {
            StreamwireError::Encode(format!("{} compression failed: {}", self.compressor.name(), e))
        })
    }

    /// Decompress, then deserialize.
    pub fn decode<M: StreamMessage>(&self, payload: Bytes) -> Result<M> {
        let decompressed = self.compressor.decompress(payload).map_err(|e| {
            StreamwireError::Decode(format!(
                "{} decompression failed: {}",
                self.compressor.name(),
                e
            ))
        })?;
        M::decode_message(self.serialization, decompressed)
    }
}
