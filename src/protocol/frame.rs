//! Frame struct with typed body accessors.
//!
//! A frame is immutable once built. Its payload is the raw body; the typed
//! views (`init_meta`, `feedback_increment`, `close_meta`) decode it on demand.
//!
//! # Example
//!
//! ```
//! use streamwire::protocol::{Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::data(3, Bytes::from_static(b"hello")).unwrap();
//! let decoded = Frame::decode(frame.encode()).unwrap();
//!
//! assert_eq!(decoded.frame_type(), FrameType::Data);
//! assert_eq!(decoded.payload(), b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::meta::{StreamCloseMeta, StreamFeedbackMeta, StreamInitMeta};
use super::wire_format::{FrameType, Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use crate::error::{Result, StreamwireError};

/// A complete stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    stream_id: u32,
    frame_type: FrameType,
    payload: Bytes,
}

impl Frame {
    /// Create a frame from its parts.
    pub fn new(stream_id: u32, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            payload,
        }
    }

    /// INIT frame carrying `meta`.
    pub fn init(stream_id: u32, meta: &StreamInitMeta) -> Self {
        Self::new(stream_id, FrameType::Init, Bytes::from(meta.encode_to_vec()))
    }

    /// DATA frame. Fails on an empty payload.
    pub fn data(stream_id: u32, payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(StreamwireError::EmptyData(stream_id));
        }
        Ok(Self::new(stream_id, FrameType::Data, payload))
    }

    /// FEEDBACK frame granting `increment` bytes. Fails unless `increment > 0`.
    pub fn feedback(stream_id: u32, increment: i32) -> Result<Self> {
        if increment <= 0 {
            return Err(StreamwireError::FlowControl {
                stream_id,
                reason: format!("window increment {} must be positive", increment),
            });
        }
        let meta = StreamFeedbackMeta {
            window_size_increment: increment,
        };
        Ok(Self::new(
            stream_id,
            FrameType::Feedback,
            Bytes::from(meta.encode_to_vec()),
        ))
    }

    /// CLOSE frame (graceful close or reset, per `meta.close_type`).
    pub fn close(stream_id: u32, meta: &StreamCloseMeta) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::from(meta.encode_to_vec()))
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Header describing this frame.
    pub fn header(&self) -> Header {
        Header::new(self.frame_type, self.stream_id, self.payload.len() as u32)
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
    }

    /// Decode one complete frame (header plus body) using the default
    /// frame size limit.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Decode one complete frame.
    ///
    /// Header errors are connection-fatal. An unknown frame type or an
    /// empty DATA body is reported against the stream id it arrived on.
    pub fn decode_with_limit(mut bytes: Bytes, max_frame_size: u32) -> Result<Self> {
        let header = Header::decode(&bytes).ok_or_else(|| {
            StreamwireError::MalformedHeader(format!(
                "need {} header bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            ))
        })?;
        header.validate(max_frame_size)?;

        if header.total_length as usize != bytes.len() {
            return Err(StreamwireError::MalformedHeader(format!(
                "total length {} does not match frame of {} bytes",
                header.total_length,
                bytes.len()
            )));
        }

        let frame_type =
            FrameType::from_u8(header.frame_type).ok_or(StreamwireError::UnknownFrameType {
                stream_id: header.stream_id,
                value: header.frame_type,
            })?;

        let payload = bytes.split_off(HEADER_SIZE);
        if frame_type == FrameType::Data && payload.is_empty() {
            return Err(StreamwireError::EmptyData(header.stream_id));
        }

        Ok(Self::new(header.stream_id, frame_type, payload))
    }

    /// Decode the INIT body.
    pub fn init_meta(&self) -> Result<StreamInitMeta> {
        self.expect_type(FrameType::Init)?;
        StreamInitMeta::decode(self.payload.clone()).map_err(|e| self.body_error(e))
    }

    /// Decode the FEEDBACK body and return its (strictly positive) increment.
    pub fn feedback_increment(&self) -> Result<i32> {
        self.expect_type(FrameType::Feedback)?;
        let meta =
            StreamFeedbackMeta::decode(self.payload.clone()).map_err(|e| self.body_error(e))?;
        if meta.window_size_increment <= 0 {
            return Err(StreamwireError::FlowControl {
                stream_id: self.stream_id,
                reason: format!(
                    "window increment {} must be positive",
                    meta.window_size_increment
                ),
            });
        }
        Ok(meta.window_size_increment)
    }

    /// Decode the CLOSE body.
    pub fn close_meta(&self) -> Result<StreamCloseMeta> {
        self.expect_type(FrameType::Close)?;
        StreamCloseMeta::decode(self.payload.clone()).map_err(|e| self.body_error(e))
    }

    fn expect_type(&self, expected: FrameType) -> Result<()> {
        if self.frame_type != expected {
            return Err(StreamwireError::Protocol {
                stream_id: self.stream_id,
                reason: format!("expected {:?} frame, got {:?}", expected, self.frame_type),
            });
        }
        Ok(())
    }

    fn body_error(&self, source: prost::DecodeError) -> StreamwireError {
        StreamwireError::BodyDecode {
            stream_id: self.stream_id,
            frame_type: self.frame_type,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::meta::StreamInitRequestMeta;

    fn sample_frames() -> Vec<Frame> {
        let init = StreamInitMeta::request(
            StreamInitRequestMeta {
                func: b"/svc/Method".to_vec(),
                ..Default::default()
            },
            65535,
            0,
            1,
        );
        vec![
            Frame::init(1, &init),
            Frame::data(1, Bytes::from_static(b"payload")).unwrap(),
            Frame::feedback(1, 8000).unwrap(),
            Frame::close(1, &StreamCloseMeta::close(0, "")),
            Frame::close(1, &StreamCloseMeta::reset(1000, "boom")),
        ]
    }

    #[test]
    fn test_roundtrip_every_frame_type() {
        for frame in sample_frames() {
            let decoded = Frame::decode(frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_corrupt_magic_is_connection_fatal() {
        for frame in sample_frames() {
            for idx in 0..2 {
                let mut bytes = frame.encode().to_vec();
                bytes[idx] ^= 0x5A;
                let err = Frame::decode(Bytes::from(bytes)).unwrap_err();
                assert!(matches!(err, StreamwireError::BadMagic { .. }));
                assert!(err.is_connection_fatal());
            }
        }
    }

    #[test]
    fn test_typed_bodies() {
        let frames = sample_frames();
        let init = frames[0].init_meta().unwrap();
        assert_eq!(init.init_window_size, 65535);
        assert_eq!(init.content_encoding, 1);
        assert_eq!(frames[2].feedback_increment().unwrap(), 8000);
        assert!(!frames[3].close_meta().unwrap().is_reset());
        let reset = frames[4].close_meta().unwrap();
        assert!(reset.is_reset());
        assert_eq!(reset.ret, 1000);
        assert_eq!(reset.message(), "boom");
    }

    #[test]
    fn test_wrong_body_accessor() {
        let frame = Frame::data(5, Bytes::from_static(b"x")).unwrap();
        let err = frame.close_meta().unwrap_err();
        assert!(matches!(err, StreamwireError::Protocol { stream_id: 5, .. }));
    }

    #[test]
    fn test_empty_data_rejected() {
        assert!(matches!(
            Frame::data(2, Bytes::new()),
            Err(StreamwireError::EmptyData(2))
        ));

        let raw = Frame::new(2, FrameType::Data, Bytes::new()).encode();
        let err = Frame::decode(raw).unwrap_err();
        assert!(matches!(err, StreamwireError::EmptyData(2)));
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_non_positive_feedback_rejected() {
        assert!(Frame::feedback(1, 0).is_err());
        assert!(Frame::feedback(1, -5).is_err());

        let meta = StreamFeedbackMeta {
            window_size_increment: -1,
        };
        let frame = Frame::new(1, FrameType::Feedback, Bytes::from(meta.encode_to_vec()));
        assert!(matches!(
            frame.feedback_increment(),
            Err(StreamwireError::FlowControl { .. })
        ));
    }

    #[test]
    fn test_unknown_frame_type_is_stream_scoped() {
        let mut bytes = Frame::data(9, Bytes::from_static(b"x")).unwrap().encode().to_vec();
        bytes[3] = 0x7F;
        let err = Frame::decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(
            err,
            StreamwireError::UnknownFrameType {
                stream_id: 9,
                value: 0x7F
            }
        ));
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_garbage_body_is_body_decode_error() {
        let frame = Frame::new(4, FrameType::Init, Bytes::from_static(&[0xFF, 0xFF, 0xFF]));
        let err = frame.init_meta().unwrap_err();
        assert!(matches!(err, StreamwireError::BodyDecode { stream_id: 4, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::StreamFatal);
    }
}
