//! Error types for streamwire.
//!
//! Every error carries an [`ErrorKind`] telling the caller which scope it
//! poisons: the whole connection, one stream, or nothing at all.

use thiserror::Error;

use crate::protocol::FrameType;

/// Ret codes carried in INIT responses and CLOSE/RESET metas.
pub mod ret {
    /// Call succeeded.
    pub const SUCCESS: i32 = 0;
    /// No handler registered for the requested method.
    pub const SERVER_NO_FUNC: i32 = 12;
    /// Server refused the stream because its worker pool is saturated.
    pub const SERVER_OVERLOAD: i32 = 22;
    /// Client cancelled the call.
    pub const CLIENT_CANCELLED: i32 = 161;

    pub const STREAM_SERVER_NETWORK: i32 = 201;
    pub const STREAM_SERVER_MSG_EXCEED_LIMIT: i32 = 211;
    pub const STREAM_SERVER_ENCODE: i32 = 221;
    pub const STREAM_SERVER_DECODE: i32 = 222;
    pub const STREAM_SERVER_READ_TIMEOUT: i32 = 254;

    pub const STREAM_CLIENT_NETWORK: i32 = 301;
    pub const STREAM_CLIENT_MSG_EXCEED_LIMIT: i32 = 311;
    pub const STREAM_CLIENT_ENCODE: i32 = 321;
    pub const STREAM_CLIENT_DECODE: i32 = 322;
    pub const STREAM_CLIENT_READ_TIMEOUT: i32 = 354;

    /// Catch-all for stream failures without a more specific code.
    pub const STREAM_UNKNOWN: i32 = 1000;
}

/// Which scope an error terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Frame boundaries can no longer be trusted; every stream is reset.
    ConnectionFatal,
    /// Only the affected stream is reset.
    StreamFatal,
    /// Non-zero `ret` reported by the peer; the protocol is healthy.
    Business,
    /// Stream deadline elapsed before a terminal frame arrived.
    Timeout,
    /// Local condition the caller can retry or correct; the stream stays usable.
    Local,
}

/// Main error type for all streamwire operations.
#[derive(Debug, Error)]
pub enum StreamwireError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame header did not start with the protocol magic.
    #[error("bad frame magic {found:#06x}")]
    BadMagic { found: u16 },

    /// Frame header is structurally invalid.
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    /// Declared frame length is outside the accepted range.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: u32, max: u32 },

    /// Frame type byte is not INIT, DATA, FEEDBACK or CLOSE.
    #[error("unknown frame type {value:#04x} on stream {stream_id}")]
    UnknownFrameType { stream_id: u32, value: u8 },

    /// Protobuf body of a control frame failed to decode.
    #[error("failed to decode {frame_type:?} body on stream {stream_id}: {source}")]
    BodyDecode {
        stream_id: u32,
        frame_type: FrameType,
        #[source]
        source: prost::DecodeError,
    },

    /// DATA frame with an empty payload.
    #[error("empty DATA frame on stream {0}")]
    EmptyData(u32),

    /// No serializer registered for the content type code.
    #[error("unsupported serialization type {0}")]
    UnsupportedSerialization(i32),

    /// No compressor registered for the content encoding code.
    #[error("unsupported compression type {0}")]
    UnsupportedCompression(i32),

    /// Message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message could not be deserialized.
    #[error("decode error: {0}")]
    Decode(String),

    /// Frame arrived that the stream's state or call shape does not allow.
    #[error("protocol violation on stream {stream_id}: {reason}")]
    Protocol { stream_id: u32, reason: String },

    /// Peer sent more DATA than the advertised window, or a bad FEEDBACK.
    #[error("flow control violation on stream {stream_id}: {reason}")]
    FlowControl { stream_id: u32, reason: String },

    /// Inbound queue for the stream is full.
    #[error("inbound queue overflow on stream {0}")]
    QueueOverflow(u32),

    /// Message is larger than the peer could ever accept: its initial
    /// window, or the frame size limit once the header is added.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: i64 },

    /// Non-blocking send found the window exhausted.
    #[error("send window exhausted")]
    WindowExhausted,

    /// Peer reported a non-zero ret in an INIT response or CLOSE.
    #[error("rpc failed with ret {ret}: {msg}")]
    Rpc { ret: i32, msg: String },

    /// Peer reset the stream.
    #[error("stream reset by peer with ret {ret}: {msg}")]
    Reset { ret: i32, msg: String },

    /// Stream deadline elapsed.
    #[error("stream timed out (ret {ret})")]
    Timeout { ret: i32 },

    /// Stream was cancelled locally.
    #[error("stream cancelled")]
    Cancelled,

    /// Operation on a stream direction that is already closed.
    #[error("stream {0} is closed")]
    StreamClosed(u32),

    /// Connection closed or torn down.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Config(String),
}

impl StreamwireError {
    /// Scope this error terminates.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::BadMagic { .. }
            | Self::MalformedHeader(_)
            | Self::FrameTooLarge { .. }
            | Self::ConnectionClosed => ErrorKind::ConnectionFatal,
            Self::Rpc { .. } => ErrorKind::Business,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::WindowExhausted
            | Self::MessageTooLarge { .. }
            | Self::StreamClosed(_)
            | Self::Config(_) => ErrorKind::Local,
            _ => ErrorKind::StreamFatal,
        }
    }

    /// Stream an error is scoped to, when it names one.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Self::UnknownFrameType { stream_id, .. }
            | Self::BodyDecode { stream_id, .. }
            | Self::Protocol { stream_id, .. }
            | Self::FlowControl { stream_id, .. } => Some(*stream_id),
            Self::EmptyData(id) | Self::QueueOverflow(id) | Self::StreamClosed(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether the whole connection must be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        self.kind() == ErrorKind::ConnectionFatal
    }

    /// Ret code reported to the peer when this error resets a stream.
    ///
    /// `client` selects the client-side or server-side code family.
    pub fn ret(&self, client: bool) -> i32 {
        let pick = |c: i32, s: i32| if client { c } else { s };
        match self {
            Self::Rpc { ret, .. } | Self::Reset { ret, .. } | Self::Timeout { ret } => *ret,
            Self::Encode(_) => pick(ret::STREAM_CLIENT_ENCODE, ret::STREAM_SERVER_ENCODE),
            Self::Decode(_)
            | Self::BodyDecode { .. }
            | Self::EmptyData(_)
            | Self::UnknownFrameType { .. }
            | Self::UnsupportedSerialization(_)
            | Self::UnsupportedCompression(_) => {
                pick(ret::STREAM_CLIENT_DECODE, ret::STREAM_SERVER_DECODE)
            }
            Self::FlowControl { .. } | Self::QueueOverflow(_) | Self::MessageTooLarge { .. } => {
                pick(ret::STREAM_CLIENT_MSG_EXCEED_LIMIT, ret::STREAM_SERVER_MSG_EXCEED_LIMIT)
            }
            Self::Io(_) | Self::ConnectionClosed => {
                pick(ret::STREAM_CLIENT_NETWORK, ret::STREAM_SERVER_NETWORK)
            }
            Self::Cancelled => ret::CLIENT_CANCELLED,
            _ => ret::STREAM_UNKNOWN,
        }
    }
}

/// Result type alias using StreamwireError.
pub type Result<T> = std::result::Result<T, StreamwireError>;
