//! Serialization registry keyed by `content_type` codes.
//!
//! Codes: `0` protobuf (prost), `2` JSON (serde_json), `4` no-op (raw
//! bytes). Codes `1`, `3`, `5` and `6` are well known elsewhere but have no
//! implementation here, so lookups for them fail.
//!
//! Unlike compression, the set of formats is closed. Encoding is generic
//! over the message type, which a `dyn` serializer cannot express, so the
//! registry resolves a code to a [`Serialization`] tag and the message's own
//! [`StreamMessage`] impl does the work. A format outside this set is carried
//! as [`Serialization::Noop`] with [`RawPayload`](super::RawPayload), encoded
//! by the application.

use std::collections::HashSet;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StreamwireError};

/// Serialization formats understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serialization {
    #[default]
    Protobuf,
    Json,
    /// Payload bytes are passed through untouched. Only [`RawPayload`]
    /// supports it.
    ///
    /// [`RawPayload`]: super::RawPayload
    Noop,
}

impl Serialization {
    /// Wire code carried in `content_type`.
    pub const fn code(self) -> i32 {
        match self {
            Self::Protobuf => 0,
            Self::Json => 2,
            Self::Noop => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Protobuf),
            2 => Some(Self::Json),
            4 => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protobuf => "protobuf",
            Self::Json => "json",
            Self::Noop => "noop",
        }
    }
}

/// The serializations a side is willing to use.
#[derive(Debug, Clone)]
pub struct SerializationRegistry {
    enabled: HashSet<Serialization>,
}

impl SerializationRegistry {
    /// Registry with nothing enabled.
    pub fn empty() -> Self {
        Self {
            enabled: HashSet::new(),
        }
    }

    pub fn register(&mut self, serialization: Serialization) -> &mut Self {
        self.enabled.insert(serialization);
        self
    }

    pub fn unregister(&mut self, serialization: Serialization) -> &mut Self {
        self.enabled.remove(&serialization);
        self
    }

    pub fn contains(&self, code: i32) -> bool {
        self.lookup(code).is_ok()
    }

    /// Resolve a `content_type` code.
    pub fn lookup(&self, code: i32) -> Result<Serialization> {
        Serialization::from_code(code)
            .filter(|s| self.enabled.contains(s))
            .ok_or(StreamwireError::UnsupportedSerialization(code))
    }
}

impl Default for SerializationRegistry {
    /// Protobuf, JSON and no-op.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Serialization::Protobuf)
            .register(Serialization::Json)
            .register(Serialization::Noop);
        registry
    }
}

/// An application message that can travel in DATA frames.
///
/// Implemented for every type that is both a prost message and serde
/// (de)serializable, and for [`RawPayload`](super::RawPayload).
pub trait StreamMessage: Sized + Send + Sync + 'static {
    /// Serialize with the stream's negotiated format.
    fn encode_message(&self, serialization: Serialization) -> Result<Bytes>;

    /// Deserialize a (decompressed) DATA payload.
    fn decode_message(serialization: Serialization, data: Bytes) -> Result<Self>;
}

impl<T> StreamMessage for T
where
    T: prost::Message + Default + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode_message(&self, serialization: Serialization) -> Result<Bytes> {
        match serialization {
            Serialization::Protobuf => Ok(Bytes::from(prost::Message::encode_to_vec(self))),
            Serialization::Json => serde_json::to_vec(self)
                .map(Bytes::from)
                .map_err(|e| StreamwireError::Encode(e.to_string())),
            Serialization::Noop => Err(StreamwireError::Encode(
                "noop serialization only carries raw payloads".to_string(),
            )),
        }
    }

    fn decode_message(serialization: Serialization, data: Bytes) -> Result<Self> {
        match serialization {
            Serialization::Protobuf => {
                <T as prost::Message>::decode(data).map_err(|e| StreamwireError::Decode(e.to_string()))
            }
            Serialization::Json => {
                serde_json::from_slice(&data).map_err(|e| StreamwireError::Decode(e.to_string()))
            }
            Serialization::Noop => Err(StreamwireError::Decode(
                "noop serialization only carries raw payloads".to_string(),
            )),
        }
    }
}
