//! Protocol module - wire format, framing, and frame bodies.
//!
//! This module implements the binary stream frame protocol:
//! - 16-byte header encoding/decoding
//! - Frame extraction from partial reads
//! - Frame struct with typed INIT/FEEDBACK/CLOSE bodies

mod frame;
mod frame_buffer;
mod meta;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::{extract_frame, FrameBuffer};
pub use meta::{
    CloseType, InitKind, StreamCloseMeta, StreamFeedbackMeta, StreamInitMeta,
    StreamInitRequestMeta, StreamInitResponseMeta,
};
pub use wire_format::{
    FrameType, Header, DATA_FRAME_TYPE_STREAM, DATA_FRAME_TYPE_UNARY, DEFAULT_MAX_FRAME_SIZE,
    HEADER_SIZE, MAGIC,
};
