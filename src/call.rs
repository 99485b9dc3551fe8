//! Call options and typed stream handles.
//!
//! [`StreamSender`] and [`StreamReceiver`] are the two halves of a stream as
//! the application sees it: one encodes and sends messages under the peer's
//! flow-control window, the other decodes received messages and returns
//! window credit as they are consumed. Clients get them from
//! [`Connection`](crate::Connection); server handlers get them as arguments.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{NegotiatedCodec, Serialization, StreamMessage, IDENTITY};
use crate::connection::{Shared, StreamEntry};
use crate::error::{ret, Result, StreamwireError};
use crate::protocol::StreamInitRequestMeta;
use crate::stream::{StreamState, Termination};

/// Per-call settings sent in the INIT request.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Method name, e.g. `/package.Service/Method`.
    pub func: String,
    pub caller: String,
    pub callee: String,
    /// Whole-call deadline. Falls back to the connection's stream timeout.
    pub timeout: Option<Duration>,
    pub serialization: Serialization,
    /// Proposed `content_encoding` code. The server may answer with identity.
    pub compression: i32,
    /// Opaque metadata forwarded to the server handler.
    pub trans_info: BTreeMap<String, Vec<u8>>,
}

impl CallOptions {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            caller: String::new(),
            callee: String::new(),
            timeout: None,
            serialization: Serialization::default(),
            compression: IDENTITY,
            trans_info: BTreeMap::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn compression(mut self, code: i32) -> Self {
        self.compression = code;
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }

    pub fn callee(mut self, callee: impl Into<String>) -> Self {
        self.callee = callee.into();
        self
    }

    pub fn trans_info(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.trans_info.insert(key.into(), value.into());
        self
    }

    pub(crate) fn init_request(&self) -> StreamInitRequestMeta {
        StreamInitRequestMeta {
            caller: self.caller.clone().into_bytes(),
            callee: self.callee.clone().into_bytes(),
            func: self.func.clone().into_bytes(),
            trans_info: self.trans_info.clone(),
        }
    }
}

/// Cancels a client stream once every handle to it has been dropped
/// before the stream ended.
pub(crate) struct CallGuard {
    entry: Arc<StreamEntry>,
    shared: Arc<Shared>,
}

impl CallGuard {
    pub(crate) fn new(entry: Arc<StreamEntry>, shared: Arc<Shared>) -> Self {
        Self { entry, shared }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.shared
            .abandon(&self.entry, ret::CLIENT_CANCELLED, "call abandoned");
    }
}

/// Sending half of a stream.
pub struct StreamSender<T> {
    entry: Arc<StreamEntry>,
    shared: Arc<Shared>,
    codec: NegotiatedCodec,
    _guard: Option<Arc<CallGuard>>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: StreamMessage> StreamSender<T> {
    pub(crate) fn new(
        entry: Arc<StreamEntry>,
        shared: Arc<Shared>,
        codec: NegotiatedCodec,
        guard: Option<Arc<CallGuard>>,
    ) -> Self {
        Self {
            entry,
            shared,
            codec,
            _guard: guard,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.entry.id
    }

    pub fn state(&self) -> StreamState {
        self.entry.session().state()
    }

    /// Credit left in the peer's window.
    pub fn available_window(&self) -> i64 {
        self.entry.send_window().map_or(0, |w| w.available())
    }

    /// Encode and send one message, waiting for window credit if needed.
    ///
    /// # Errors
    ///
    /// - `MessageTooLarge` if the encoded message exceeds the peer's initial
    ///   window or does not fit in one frame; the stream stays usable
    /// - `Encode` if the message encodes to zero bytes
    /// - the stream's outcome once it has been closed or reset
    pub async fn send(&mut self, message: &T) -> Result<()> {
        let payload = self.codec.encode(message)?;
        self.shared.send_data(&self.entry, payload).await
    }

    /// Send without waiting. Fails with `WindowExhausted` when the window
    /// (or the writer queue) has no room right now.
    pub fn try_send(&mut self, message: &T) -> Result<()> {
        let payload = self.codec.encode(message)?;
        self.shared.try_send_data(&self.entry, payload)
    }

    /// Send and reset the stream if sending fails, for call shapes where a
    /// failed request leaves nothing to retry.
    pub(crate) async fn send_or_abort(&mut self, message: &T) -> Result<()> {
        match self.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.fail_stream(&self.entry, &e).await;
                Err(e)
            }
        }
    }

    /// Finish this direction gracefully (CLOSE with ret 0).
    pub async fn close(self) -> Result<()> {
        self.shared
            .send_close(&self.entry, ret::SUCCESS, "")
            .await
    }

    /// Abort the whole stream (RESET with ret 161).
    pub async fn cancel(self) {
        self.shared.cancel(&self.entry).await;
    }
}

impl<T> std::fmt::Debug for StreamSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSender")
            .field("stream_id", &self.entry.id)
            .field("serialization", &self.codec.serialization())
            .finish()
    }
}

/// Receiving half of a stream.
pub struct StreamReceiver<T> {
    entry: Arc<StreamEntry>,
    shared: Arc<Shared>,
    codec: NegotiatedCodec,
    inbound: mpsc::Receiver<Bytes>,
    _guard: Option<Arc<CallGuard>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StreamMessage> StreamReceiver<T> {
    pub(crate) fn new(
        entry: Arc<StreamEntry>,
        shared: Arc<Shared>,
        codec: NegotiatedCodec,
        inbound: mpsc::Receiver<Bytes>,
        guard: Option<Arc<CallGuard>>,
    ) -> Self {
        Self {
            entry,
            shared,
            codec,
            inbound,
            _guard: guard,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.entry.id
    }

    /// How the stream ended, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.entry.termination()
    }

    /// Next message, or `Ok(None)` once the peer has finished sending.
    ///
    /// A reset surfaces immediately even if messages are still buffered. A
    /// business failure (non-zero ret in CLOSE) surfaces after the buffered
    /// messages. Consuming a message may send FEEDBACK to the peer.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        if let Some(Termination::Reset { .. }) = self.entry.termination() {
            return Err(self.end_error().unwrap_or(StreamwireError::StreamClosed(self.entry.id)));
        }
        let Some(payload) = self.inbound.recv().await else {
            return match self.end_error() {
                Some(e) => Err(e),
                None => Ok(None),
            };
        };

        let size = payload.len();
        match self.codec.decode::<T>(payload) {
            Ok(message) => {
                self.shared.consumed(&self.entry, size).await;
                Ok(Some(message))
            }
            Err(e) => {
                self.shared.fail_stream(&self.entry, &e).await;
                Err(e)
            }
        }
    }

    fn end_error(&self) -> Option<StreamwireError> {
        self.entry.termination().and_then(|t| t.to_error())
    }

    /// Read the single response of a unary or client-streaming call and wait
    /// for the server's verdict.
    pub(crate) async fn into_single(mut self) -> Result<T> {
        let message = self.recv().await?;
        if let Some(error) = self
            .entry
            .terminated()
            .await
            .as_ref()
            .and_then(Termination::to_error)
        {
            return Err(error);
        }
        message.ok_or_else(|| StreamwireError::Protocol {
            stream_id: self.entry.id,
            reason: "stream closed without a response".to_string(),
        })
    }

    /// Abort the whole stream (RESET with ret 161).
    pub async fn cancel(self) {
        self.shared.cancel(&self.entry).await;
    }
}

impl<T> std::fmt::Debug for StreamReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("stream_id", &self.entry.id)
            .field("serialization", &self.codec.serialization())
            .finish()
    }
}

/// In-flight client-streaming call: send requests, then `finish` for the
/// response.
#[derive(Debug)]
pub struct ClientStreamingCall<Req, Resp> {
    sender: StreamSender<Req>,
    receiver: StreamReceiver<Resp>,
}

impl<Req: StreamMessage, Resp: StreamMessage> ClientStreamingCall<Req, Resp> {
    pub(crate) fn new(sender: StreamSender<Req>, receiver: StreamReceiver<Resp>) -> Self {
        Self { sender, receiver }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.sender.stream_id()
    }

    pub async fn send(&mut self, message: &Req) -> Result<()> {
        self.sender.send(message).await
    }

    pub fn try_send(&mut self, message: &Req) -> Result<()> {
        self.sender.try_send(message)
    }

    /// Close the request stream and wait for the response.
    ///
    /// If the server already answered with an error, that error is returned.
    pub async fn finish(self) -> Result<Resp> {
        let Self { sender, receiver } = self;
        if let Err(e) = sender.close().await {
            // A server that already failed the call has the better error.
            return Err(receiver.end_error().unwrap_or(e));
        }
        receiver.into_single().await
    }

    pub async fn cancel(self) {
        self.sender.cancel().await;
    }
}
