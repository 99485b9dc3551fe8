//! Stream lifecycle events broadcast to observers.

use crate::stream::{ResetOrigin, Role};

/// Something that happened to a stream of this connection.
///
/// Delivered through [`Connection::subscribe`](super::Connection::subscribe).
/// Slow subscribers lag and lose the oldest events; the protocol never waits
/// for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// INIT exchange completed.
    Opened {
        stream_id: u32,
        func: String,
        role: Role,
    },
    /// DATA frame received.
    Data { stream_id: u32, size: usize },
    /// FEEDBACK frame received.
    Feedback { stream_id: u32, increment: i32 },
    /// Stream closed gracefully. `ret` is the final verdict.
    Closed { stream_id: u32, ret: i32 },
    /// Stream aborted.
    Reset {
        stream_id: u32,
        ret: i32,
        origin: ResetOrigin,
    },
}

impl StreamEvent {
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Opened { stream_id, .. }
            | Self::Data { stream_id, .. }
            | Self::Feedback { stream_id, .. }
            | Self::Closed { stream_id, .. }
            | Self::Reset { stream_id, .. } => *stream_id,
        }
    }

    /// Whether this is the last event for its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Reset { .. })
    }
}
