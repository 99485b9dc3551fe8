//! Stream lifecycle states, call shapes and terminal outcomes.

use std::fmt;

use crate::error::{ret, StreamwireError};

/// Lifecycle state of one stream.
///
/// ```text
/// HANDSHAKING ──► ESTABLISHED ──► HALF_CLOSED_{LOCAL,REMOTE} ──► CLOSED
///      │               │                    │
///      └───────────────┴────────────────────┴──────────────────► RESET
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// INIT sent or received, counterpart INIT not yet seen.
    Handshaking,
    /// Both directions open.
    Established,
    /// Local side has finished sending; the peer may still send.
    HalfClosedLocal,
    /// Peer has finished sending; the local side may still send.
    HalfClosedRemote,
    /// Both directions finished gracefully.
    Closed,
    /// Aborted.
    Reset,
}

impl StreamState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }

    /// Whether the local side may still send DATA.
    #[inline]
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::HalfClosedRemote)
    }

    /// Whether the peer may still send DATA.
    #[inline]
    pub fn can_recv(self) -> bool {
        matches!(self, Self::Established | Self::HalfClosedLocal)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshaking => "HANDSHAKING",
            Self::Established => "ESTABLISHED",
            Self::HalfClosedLocal => "HALF_CLOSED_LOCAL",
            Self::HalfClosedRemote => "HALF_CLOSED_REMOTE",
            Self::Closed => "CLOSED",
            Self::Reset => "RESET",
        };
        f.write_str(name)
    }
}

/// Which end of the stream this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the INIT request.
    Client,
    /// Answered the INIT request.
    Server,
}

impl Role {
    /// Ret code for a locally detected deadline.
    pub fn timeout_ret(self) -> i32 {
        match self {
            Self::Client => ret::STREAM_CLIENT_READ_TIMEOUT,
            Self::Server => ret::STREAM_SERVER_READ_TIMEOUT,
        }
    }

    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }
}

/// The four RPC call shapes carried over streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// One request, one response.
    Unary,
    /// Request stream, one response.
    ClientStreaming,
    /// One request, response stream.
    ServerStreaming,
    /// Independent streams both ways.
    Bidi,
}

impl CallShape {
    /// Client sends exactly one DATA and no CLOSE.
    #[inline]
    pub fn single_request(self) -> bool {
        matches!(self, Self::Unary | Self::ServerStreaming)
    }

    /// Server sends exactly one DATA before its CLOSE.
    #[inline]
    pub fn single_response(self) -> bool {
        matches!(self, Self::Unary | Self::ClientStreaming)
    }
}

/// Who caused a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOrigin {
    /// RESET frame received.
    Peer,
    /// Reset by this side (cancellation, protocol or decode error).
    Local,
    /// Deadline elapsed.
    Timeout,
    /// Connection torn down.
    Connection,
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Both directions closed. A non-zero `ret` is a business failure.
    Closed { ret: i32, msg: String },
    /// Aborted.
    Reset {
        ret: i32,
        msg: String,
        origin: ResetOrigin,
    },
}

impl Termination {
    pub fn ret(&self) -> i32 {
        match self {
            Self::Closed { ret, .. } | Self::Reset { ret, .. } => *ret,
        }
    }

    /// Graceful close with ret 0.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Closed { ret: ret::SUCCESS, .. })
    }

    /// The error an application call observes, or `None` on success.
    pub fn to_error(&self) -> Option<StreamwireError> {
        match self {
            Self::Closed { ret: ret::SUCCESS, .. } => None,
            Self::Closed { ret, msg } => Some(StreamwireError::Rpc {
                ret: *ret,
                msg: msg.clone(),
            }),
            Self::Reset { ret, origin, msg } => Some(match origin {
                ResetOrigin::Timeout => StreamwireError::Timeout { ret: *ret },
                ResetOrigin::Connection => StreamwireError::ConnectionClosed,
                ResetOrigin::Local if *ret == ret::CLIENT_CANCELLED => StreamwireError::Cancelled,
                ResetOrigin::Peer | ResetOrigin::Local => StreamwireError::Reset {
                    ret: *ret,
                    msg: msg.clone(),
                },
            }),
        }
    }
}
