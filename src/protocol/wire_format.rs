//! Wire format encoding and decoding.
//!
//! Implements the 16-byte stream frame header:
//! ```text
//! ┌───────┬────────────┬────────────┬──────────┬──────────┬───────────┬──────────┐
//! │ Magic │ Data frame │ Frame type │ Total    │ Reserved │ Stream ID │ Reserved │
//! │ 2 B   │ type 1 B   │ 1 B        │ len 4 B  │ 2 B      │ 4 B       │ 2 B      │
//! └───────┴────────────┴────────────┴──────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The total length covers the
//! header itself plus the body.

use crate::error::{Result, StreamwireError};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Magic value opening every frame.
pub const MAGIC: u16 = 0x0930;

/// Data frame type of the (non-streaming) unary frame family.
pub const DATA_FRAME_TYPE_UNARY: u8 = 0x00;

/// Data frame type marking a stream frame.
pub const DATA_FRAME_TYPE_STREAM: u8 = 0x01;

/// Default maximum total frame size (10 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Stream frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a stream and negotiates codecs and windows.
    Init = 0x01,
    /// Carries one serialized, compressed application message.
    Data = 0x02,
    /// Grants the peer more send window.
    Feedback = 0x03,
    /// Half-closes (CLOSE) or aborts (RESET) a stream.
    Close = 0x04,
}

impl FrameType {
    /// Map a wire byte to a frame type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Init),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Feedback),
            0x04 => Some(Self::Close),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic value (must equal [`MAGIC`]).
    pub magic: u16,
    /// Frame family marker (must equal [`DATA_FRAME_TYPE_STREAM`]).
    pub data_frame_type: u8,
    /// Raw frame type byte, see [`FrameType`].
    pub frame_type: u8,
    /// Header plus body length in bytes.
    pub total_length: u32,
    /// Stream identifier.
    pub stream_id: u32,
}

impl Header {
    /// Create a stream frame header.
    pub fn new(frame_type: FrameType, stream_id: u32, body_length: u32) -> Self {
        Self {
            magic: MAGIC,
            data_frame_type: DATA_FRAME_TYPE_STREAM,
            frame_type: frame_type.as_u8(),
            total_length: HEADER_SIZE as u32 + body_length,
            stream_id,
        }
    }

    /// Encode header to bytes (Big Endian). Reserved fields are zero.
    ///
    /// # Example
    ///
    /// ```
    /// use streamwire::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(FrameType::Data, 7, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[..2], &[0x09, 0x30]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2] = self.data_frame_type;
        buf[3] = self.frame_type;
        buf[4..8].copy_from_slice(&self.total_length.to_be_bytes());
        buf[8..10].fill(0);
        buf[10..14].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[14..16].fill(0);
    }

    /// Decode header from bytes (Big Endian) without validating it.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u16::from_be_bytes([buf[0], buf[1]]),
            data_frame_type: buf[2],
            frame_type: buf[3],
            total_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            stream_id: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }

    /// Validate the header fields that frame boundaries depend on.
    ///
    /// Every failure here is connection-fatal:
    /// - magic must match
    /// - the frame must belong to the stream family
    /// - total length must cover the header and stay under `max_frame_size`
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StreamwireError::BadMagic { found: self.magic });
        }

        if self.data_frame_type != DATA_FRAME_TYPE_STREAM {
            return Err(StreamwireError::MalformedHeader(format!(
                "data frame type {:#04x} is not a stream frame",
                self.data_frame_type
            )));
        }

        if (self.total_length as usize) < HEADER_SIZE {
            return Err(StreamwireError::MalformedHeader(format!(
                "total length {} shorter than header",
                self.total_length
            )));
        }

        if self.total_length > max_frame_size {
            return Err(StreamwireError::FrameTooLarge {
                length: self.total_length,
                max: max_frame_size,
            });
        }

        Ok(())
    }

    /// Body length in bytes.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(FrameType::Feedback, 42, 4);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.total_length, 20);
        assert_eq!(decoded.body_length(), 4);
    }

    #[test]
    fn test_header_byte_layout() {
        let header = Header::new(FrameType::Close, 0x0A0B0C0D, 0x10);
        let bytes = header.encode();

        assert_eq!(&bytes[0..2], &[0x09, 0x30]);
        assert_eq!(bytes[2], DATA_FRAME_TYPE_STREAM);
        assert_eq!(bytes[3], 0x04);
        // 16 header + 16 body
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0x20]);
        assert_eq!(&bytes[8..10], &[0, 0]);
        assert_eq!(&bytes[10..14], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[14..16], &[0, 0]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_bad_magic() {
        let mut bytes = Header::new(FrameType::Data, 1, 3).encode();
        bytes[1] ^= 0xFF;
        let header = Header::decode(&bytes).unwrap();
        let err = header.validate(DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, StreamwireError::BadMagic { .. }));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_validate_unary_family_rejected() {
        let mut header = Header::new(FrameType::Data, 1, 3);
        header.data_frame_type = DATA_FRAME_TYPE_UNARY;
        let err = header.validate(DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(err.to_string().contains("not a stream frame"));
    }

    #[test]
    fn test_validate_length_bounds() {
        let mut header = Header::new(FrameType::Data, 1, 0);
        header.total_length = 8;
        assert!(header.validate(DEFAULT_MAX_FRAME_SIZE).is_err());

        let header = Header::new(FrameType::Data, 1, 1000);
        let err = header.validate(100).unwrap_err();
        assert!(matches!(err, StreamwireError::FrameTooLarge { length: 1016, max: 100 }));
    }

    #[test]
    fn test_frame_type_codes() {
        for ft in [
            FrameType::Init,
            FrameType::Data,
            FrameType::Feedback,
            FrameType::Close,
        ] {
            assert_eq!(FrameType::from_u8(ft.as_u8()), Some(ft));
        }
        assert_eq!(FrameType::from_u8(0), None);
        assert_eq!(FrameType::from_u8(5), None);
    }
}
