//! What a server handler knows about its call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::call::{StreamReceiver, StreamSender};
use crate::codec::{NegotiatedCodec, Serialization, StreamMessage};
use crate::connection::{now, Shared, StreamEntry};
use crate::error::{ret, Result};
use crate::protocol::StreamInitRequestMeta;

/// Metadata of an accepted stream, handed to its handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    stream_id: u32,
    func: String,
    caller: String,
    callee: String,
    trans_info: BTreeMap<String, Vec<u8>>,
    deadline: Option<Instant>,
    serialization: Serialization,
    content_encoding: i32,
}

impl CallContext {
    pub(crate) fn from_request(
        stream_id: u32,
        request: &StreamInitRequestMeta,
        deadline: Option<Instant>,
        codec: &NegotiatedCodec,
    ) -> Self {
        Self {
            stream_id,
            func: request.func_name(),
            caller: String::from_utf8_lossy(&request.caller).into_owned(),
            callee: String::from_utf8_lossy(&request.callee).into_owned(),
            trans_info: request.trans_info.clone(),
            deadline,
            serialization: codec.serialization(),
            content_encoding: codec.content_encoding(),
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    #[inline]
    pub fn func(&self) -> &str {
        &self.func
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn trans_info(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.trans_info
    }

    /// Value of one `trans_info` key.
    pub fn trans_value(&self, key: &str) -> Option<&[u8]> {
        self.trans_info.get(key).map(Vec::as_slice)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the stream deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now()))
    }

    /// Negotiated serialization.
    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    /// Negotiated `content_encoding` code.
    pub fn content_encoding(&self) -> i32 {
        self.content_encoding
    }
}

/// An accepted stream waiting for its handler.
pub struct ServerCall {
    ctx: CallContext,
    entry: Arc<StreamEntry>,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Bytes>,
    codec: NegotiatedCodec,
}

impl ServerCall {
    pub(crate) fn new(
        ctx: CallContext,
        entry: Arc<StreamEntry>,
        shared: Arc<Shared>,
        inbound: mpsc::Receiver<Bytes>,
        codec: NegotiatedCodec,
    ) -> Self {
        Self {
            ctx,
            entry,
            shared,
            inbound,
            codec,
        }
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Split into typed handles plus the completion that reports the
    /// handler's result to the peer.
    pub fn into_parts<Req, Resp>(self) -> (CallContext, StreamReceiver<Req>, StreamSender<Resp>, Completion)
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        let receiver = StreamReceiver::new(
            self.entry.clone(),
            self.shared.clone(),
            self.codec.clone(),
            self.inbound,
            None,
        );
        let sender = StreamSender::new(self.entry.clone(), self.shared.clone(), self.codec, None);
        let completion = Completion {
            entry: self.entry,
            shared: self.shared,
            finished: false,
        };
        (self.ctx, receiver, sender, completion)
    }
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall").field("ctx", &self.ctx).finish()
    }
}

/// Ends a server call once its handler has returned.
///
/// Dropped without [`finish`](Self::finish), as when the handler panics, it
/// resets the stream with ret 1000.
pub struct Completion {
    entry: Arc<StreamEntry>,
    shared: Arc<Shared>,
    finished: bool,
}

impl Completion {
    /// `Ok` closes with ret 0, [`Rpc`](crate::StreamwireError::Rpc) closes
    /// with its ret, any other error resets the stream.
    pub async fn finish(mut self, result: Result<()>) -> Result<()> {
        self.finished = true;
        self.shared.finish_server_call(&self.entry, result).await
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            self.shared
                .abandon(&self.entry, ret::STREAM_UNKNOWN, "handler ended without a result");
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("stream_id", &self.entry.id)
            .finish()
    }
}
