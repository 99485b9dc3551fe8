//! Frame extraction from an accumulating read buffer.
//!
//! [`extract_frame`] is the pure core: it inspects the buffer, returns
//! `Ok(None)` until a whole frame is present, and otherwise splits exactly one
//! frame off the front (zero-copy via `BytesMut::split_to`). [`FrameBuffer`]
//! wraps it for the read loop: push socket bytes, get decoded frames back.
//!
//! # Example
//!
//! ```
//! use streamwire::protocol::{Frame, FrameBuffer};
//! use bytes::Bytes;
//!
//! let wire = Frame::data(1, Bytes::from_static(b"hi")).unwrap().encode();
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&wire[..5]).unwrap().is_empty());
//! let frames = buffer.push(&wire[5..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{Result, StreamwireError};

/// Split one complete raw frame off the front of `buf`.
///
/// Returns:
/// - `Ok(Some(bytes))` with exactly one frame (header included)
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the header is corrupt; this is connection-fatal
pub fn extract_frame(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Bytes>> {
    let header = match Header::decode(buf) {
        Some(header) => header,
        None => return Ok(None),
    };
    header.validate(max_frame_size)?;

    let total = header.total_length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    Ok(Some(buf.split_to(total).freeze()))
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Once an error has been returned the buffer is poisoned: frame boundaries
/// are lost, so every later push fails too.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed total frame size.
    max_frame_size: u32,
    /// Set after a connection-fatal header error.
    poisoned: bool,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 10 MiB.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
            poisoned: false,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Header-level corruption (connection-fatal) is returned as `Err`.
    /// Stream-scoped decode failures (unknown frame type, empty DATA) are
    /// returned in-line so the caller can reset just that stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Result<Frame>>> {
        if self.poisoned {
            return Err(StreamwireError::MalformedHeader(
                "frame buffer poisoned by an earlier error".to_string(),
            ));
        }

        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            match extract_frame(&mut self.buffer, self.max_frame_size) {
                Ok(Some(raw)) => frames.push(Frame::decode_with_limit(raw, self.max_frame_size)),
                Ok(None) => break,
                Err(e) => {
                    self.poisoned = true;
                    return Err(e);
                }
            }
        }

        Ok(frames)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a partial header is buffered.
    pub fn awaiting_header(&self) -> bool {
        !self.buffer.is_empty() && self.buffer.len() < HEADER_SIZE
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameType, StreamCloseMeta};

    fn frames_ok(pushed: Vec<Result<Frame>>) -> Vec<Frame> {
        pushed.into_iter().map(|f| f.unwrap()).collect()
    }

    fn sample_wire() -> (Vec<Frame>, Vec<u8>) {
        let frames = vec![
            Frame::data(1, Bytes::from_static(b"first")).unwrap(),
            Frame::feedback(3, 1024).unwrap(),
            Frame::data(3, Bytes::from(vec![0xAB; 300])).unwrap(),
            Frame::close(1, &StreamCloseMeta::close(0, "done")),
        ];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend_from_slice(&f.encode());
        }
        (frames, wire)
    }

    #[test]
    fn test_extract_not_ready_then_one_frame() {
        let wire = Frame::data(7, Bytes::from_static(b"abc")).unwrap().encode();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&wire[..HEADER_SIZE - 1]);
        assert!(extract_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());

        buf.extend_from_slice(&wire[HEADER_SIZE - 1..wire.len() - 1]);
        assert!(extract_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().is_none());

        buf.extend_from_slice(&wire[wire.len() - 1..]);
        buf.extend_from_slice(b"tail");
        let raw = extract_frame(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap().unwrap();
        assert_eq!(raw, wire);
        assert_eq!(&buf[..], b"tail");
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let (expected, wire) = sample_wire();
        let mut buffer = FrameBuffer::new();
        let frames = frames_ok(buffer.push(&wire).unwrap());
        assert_eq!(frames, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_matches_single_push() {
        let (expected, wire) = sample_wire();
        let mut buffer = FrameBuffer::new();
        let mut all_frames = Vec::new();

        for byte in &wire {
            all_frames.extend(frames_ok(buffer.push(&[*byte]).unwrap()));
        }

        assert_eq!(all_frames, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let wire = Frame::data(1, Bytes::from_static(b"test")).unwrap().encode();
        let mut buffer = FrameBuffer::new();

        assert!(buffer.push(&wire[..5]).unwrap().is_empty());
        assert!(buffer.awaiting_header());

        let frames = frames_ok(buffer.push(&wire[5..]).unwrap());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), b"test");
    }

    #[test]
    fn test_bad_magic_poisons_buffer() {
        let mut wire = Frame::data(1, Bytes::from_static(b"x")).unwrap().encode().to_vec();
        wire[0] = 0;
        let mut buffer = FrameBuffer::new();

        let err = buffer.push(&wire).unwrap_err();
        assert!(matches!(err, StreamwireError::BadMagic { .. }));
        assert!(buffer.push(&[]).is_err());
    }

    #[test]
    fn test_max_frame_size_validation() {
        let mut buffer = FrameBuffer::with_max_frame_size(64);
        let header = crate::protocol::Header::new(FrameType::Data, 1, 1000);

        let err = buffer.push(&header.encode()).unwrap_err();
        assert!(matches!(err, StreamwireError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_stream_scoped_error_does_not_stop_extraction() {
        let mut bad = Frame::data(2, Bytes::from_static(b"x")).unwrap().encode().to_vec();
        bad[3] = 0x09;
        let good = Frame::data(4, Bytes::from_static(b"y")).unwrap().encode();

        let mut wire = bad;
        wire.extend_from_slice(&good);

        let mut buffer = FrameBuffer::new();
        let results = buffer.push(&wire).unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(StreamwireError::UnknownFrameType { stream_id: 2, .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().stream_id(), 4);
    }
}
