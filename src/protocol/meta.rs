//! Protobuf bodies of INIT, FEEDBACK and CLOSE frames.
//!
//! DATA frames carry opaque bytes and have no schema here.

use std::collections::BTreeMap;

use prost::Message;

/// INIT frame body. Carries either the request or the response half of
/// the handshake, plus the sender's window and codec codes.
#[derive(Clone, PartialEq, Message)]
pub struct StreamInitMeta {
    #[prost(oneof = "InitKind", tags = "1, 2")]
    pub kind: Option<InitKind>,
    #[prost(int32, tag = "3")]
    pub init_window_size: i32,
    #[prost(int32, tag = "4")]
    pub content_type: i32,
    #[prost(int32, tag = "5")]
    pub content_encoding: i32,
}

/// Which side of the handshake an INIT frame belongs to.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum InitKind {
    #[prost(message, tag = "1")]
    Request(StreamInitRequestMeta),
    #[prost(message, tag = "2")]
    Response(StreamInitResponseMeta),
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamInitRequestMeta {
    #[prost(bytes = "vec", tag = "1")]
    pub caller: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub callee: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub func: Vec<u8>,
    #[prost(btree_map = "string, bytes", tag = "5")]
    pub trans_info: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamInitResponseMeta {
    #[prost(int32, tag = "1")]
    pub ret: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub error_msg: Vec<u8>,
}

/// FEEDBACK frame body.
#[derive(Clone, PartialEq, Message)]
pub struct StreamFeedbackMeta {
    #[prost(int32, tag = "1")]
    pub window_size_increment: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CloseType {
    /// Graceful half-close of one direction.
    Close = 0,
    /// Abort of both directions.
    Reset = 1,
}

/// CLOSE frame body.
#[derive(Clone, PartialEq, Message)]
pub struct StreamCloseMeta {
    #[prost(enumeration = "CloseType", tag = "1")]
    pub close_type: i32,
    #[prost(int32, tag = "2")]
    pub ret: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub msg: Vec<u8>,
}

impl StreamInitMeta {
    /// Build the initiator's INIT body.
    pub fn request(
        request: StreamInitRequestMeta,
        init_window_size: u32,
        content_type: i32,
        content_encoding: i32,
    ) -> Self {
        Self {
            kind: Some(InitKind::Request(request)),
            init_window_size: clamp_window(init_window_size),
            content_type,
            content_encoding,
        }
    }

    /// Build a successful INIT response carrying the negotiated codecs.
    pub fn accepted(init_window_size: u32, content_type: i32, content_encoding: i32) -> Self {
        Self {
            kind: Some(InitKind::Response(StreamInitResponseMeta {
                ret: 0,
                error_msg: Vec::new(),
            })),
            init_window_size: clamp_window(init_window_size),
            content_type,
            content_encoding,
        }
    }

    /// Build a failed INIT response. Content fields are left unset.
    pub fn rejected(ret: i32, error_msg: impl Into<String>) -> Self {
        Self {
            kind: Some(InitKind::Response(StreamInitResponseMeta {
                ret,
                error_msg: error_msg.into().into_bytes(),
            })),
            init_window_size: 0,
            content_type: 0,
            content_encoding: 0,
        }
    }

    pub fn request_meta(&self) -> Option<&StreamInitRequestMeta> {
        match &self.kind {
            Some(InitKind::Request(r)) => Some(r),
            _ => None,
        }
    }

    pub fn response_meta(&self) -> Option<&StreamInitResponseMeta> {
        match &self.kind {
            Some(InitKind::Response(r)) => Some(r),
            _ => None,
        }
    }
}

impl StreamInitRequestMeta {
    /// Method name as UTF-8, lossily.
    pub fn func_name(&self) -> String {
        String::from_utf8_lossy(&self.func).into_owned()
    }
}

impl StreamCloseMeta {
    pub fn close(ret: i32, msg: impl Into<String>) -> Self {
        Self {
            close_type: CloseType::Close as i32,
            ret,
            msg: msg.into().into_bytes(),
        }
    }

    pub fn reset(ret: i32, msg: impl Into<String>) -> Self {
        Self {
            close_type: CloseType::Reset as i32,
            ret,
            msg: msg.into().into_bytes(),
        }
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        self.close_type() == CloseType::Reset
    }

    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.msg).into_owned()
    }
}

fn clamp_window(size: u32) -> i32 {
    size.min(i32::MAX as u32) as i32
}
