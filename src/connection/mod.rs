//! Multiplexed stream connection.
//!
//! A [`Connection`] owns one byte stream and runs two background tasks on
//! it: the read loop, which decodes frames and routes them to their stream,
//! and the batching writer task. Every stream of the connection lives in a
//! single table keyed by stream id; application handles
//! ([`StreamSender`], [`StreamReceiver`]) and server handlers reach back
//! into that table to send frames.
//!
//! # Example
//!
//! ```ignore
//! use streamwire::{CallOptions, Connection, ServiceRegistry};
//!
//! let mut services = ServiceRegistry::new();
//! services.register_unary("/greeter/Hello", |_ctx, req: Greeting| async move { Ok(req) });
//!
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let _server = Connection::builder().server().services(services).build(server_io)?;
//! let client = Connection::builder().build(client_io)?;
//!
//! let reply: Greeting = client.unary(CallOptions::new("/greeter/Hello"), &request).await?;
//! ```

mod builder;
mod entry;
mod event;
mod inbound;

pub use builder::{ConnectionBuilder, Endpoint};
pub(crate) use entry::StreamEntry;
pub use event::StreamEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use prost::Message as _;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::call::{CallGuard, CallOptions, ClientStreamingCall, StreamReceiver, StreamSender};
use crate::codec::{CodecRegistry, NegotiatedCodec, StreamMessage};
use crate::config::StreamConfig;
use crate::error::{ret, Result, StreamwireError};
use crate::flow_control::RecvWindow;
use crate::handler::ServiceRegistry;
use crate::protocol::{Frame, FrameBuffer, StreamCloseMeta, StreamInitMeta, HEADER_SIZE};
use crate::stream::{CallShape, ResetOrigin, Role, StreamSession, Termination};
use crate::worker::{WorkerPool, WorkerStats};
use crate::writer::WriterHandle;

/// Read buffer size for the socket.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Current time on the runtime clock, so deadlines follow paused test time.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn network_ret(role: Role) -> i32 {
    match role {
        Role::Client => ret::STREAM_CLIENT_NETWORK,
        Role::Server => ret::STREAM_SERVER_NETWORK,
    }
}

/// State shared by the connection handle, its background tasks and every
/// stream handle.
pub(crate) struct Shared {
    endpoint: Endpoint,
    pub(crate) config: StreamConfig,
    codecs: Arc<CodecRegistry>,
    services: Option<Arc<ServiceRegistry>>,
    workers: WorkerPool,
    writer: WriterHandle,
    streams: Mutex<HashMap<u32, Arc<StreamEntry>>>,
    next_stream_id: AtomicU32,
    events: broadcast::Sender<StreamEvent>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, HashMap<u32, Arc<StreamEntry>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stream(&self, stream_id: u32) -> Option<Arc<StreamEntry>> {
        self.streams().get(&stream_id).cloned()
    }

    fn insert_stream(&self, entry: Arc<StreamEntry>) -> Result<()> {
        let mut streams = self.streams();
        // Checked under the table lock so teardown cannot miss the entry.
        if self.is_closed() {
            return Err(StreamwireError::ConnectionClosed);
        }
        if streams.contains_key(&entry.id) {
            return Err(StreamwireError::Protocol {
                stream_id: entry.id,
                reason: "stream id already in use".to_string(),
            });
        }
        streams.insert(entry.id, entry);
        Ok(())
    }

    fn remove_stream(&self, entry: &StreamEntry) {
        let mut streams = self.streams();
        if streams
            .get(&entry.id)
            .is_some_and(|live| std::ptr::eq(live.as_ref(), entry))
        {
            streams.remove(&entry.id);
        }
    }

    fn allocate_stream_id(&self) -> Result<u32> {
        self.next_stream_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| id.checked_add(2))
            .map_err(|_| StreamwireError::Protocol {
                stream_id: 0,
                reason: "stream ids exhausted".to_string(),
            })
    }

    fn emit(&self, event: StreamEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn write(&self, frame: Frame) -> Result<()> {
        self.writer.send(frame).await
    }

    async fn write_reset(&self, stream_id: u32, ret: i32, msg: &str) {
        let frame = Frame::close(stream_id, &StreamCloseMeta::reset(ret, msg));
        if let Err(e) = self.write(frame).await {
            tracing::debug!(stream_id, ret, error = %e, "RESET not sent");
        }
    }

    /// Bookkeeping once a session has reached `CLOSED` or `RESET`: drop it
    /// from the table, wake everything waiting on it and report the outcome.
    fn finish(&self, entry: &StreamEntry) {
        let termination = entry.session().termination().cloned();
        let Some(termination) = termination else {
            return;
        };
        self.remove_stream(entry);
        if !entry.complete(termination.clone()) {
            return;
        }

        let stream_id = entry.id;
        match termination {
            Termination::Closed { ret, msg } => {
                tracing::debug!(stream_id, func = %entry.func, ret, msg = %msg, "stream closed");
                self.emit(StreamEvent::Closed { stream_id, ret });
            }
            Termination::Reset { ret, msg, origin } => {
                if origin == ResetOrigin::Timeout {
                    tracing::warn!(stream_id, func = %entry.func, ret, "stream deadline exceeded");
                } else {
                    tracing::debug!(stream_id, func = %entry.func, ret, ?origin, msg = %msg, "stream reset");
                }
                self.emit(StreamEvent::Reset {
                    stream_id,
                    ret,
                    origin,
                });
            }
        }
    }

    /// Finish the stream if the last transition made it terminal.
    fn settle(&self, entry: &StreamEntry) {
        let terminal = entry.session().is_terminal();
        if terminal {
            self.finish(entry);
        }
    }

    /// Abort a live stream from this side and tell the peer.
    ///
    /// Returns `false` if the stream had already ended.
    async fn reset_stream(&self, entry: &StreamEntry, ret: i32, msg: &str, origin: ResetOrigin) -> bool {
        let reset = entry.session().reset(ret, msg, origin);
        if reset {
            self.finish(entry);
            self.write_reset(entry.id, ret, msg).await;
        }
        reset
    }

    /// Reset a stream because of a stream-scoped error.
    pub(crate) async fn fail_stream(&self, entry: &StreamEntry, error: &StreamwireError) {
        let ret = error.ret(entry.role.is_client());
        if self
            .reset_stream(entry, ret, &error.to_string(), ResetOrigin::Local)
            .await
        {
            tracing::warn!(stream_id = entry.id, ret, error = %error, "stream failed");
        }
    }

    /// Client cancellation (RESET with ret 161).
    pub(crate) async fn cancel(&self, entry: &StreamEntry) {
        self.reset_stream(entry, ret::CLIENT_CANCELLED, "cancelled by client", ResetOrigin::Local)
            .await;
    }

    /// Synchronous reset for calls whose owner went away mid-call: client
    /// handles dropped early, or a server handler that panicked.
    pub(crate) fn abandon(&self, entry: &StreamEntry, ret: i32, msg: &str) {
        let reset = entry.session().reset(ret, msg, ResetOrigin::Local);
        if !reset {
            return;
        }
        self.finish(entry);
        let frame = Frame::close(entry.id, &StreamCloseMeta::reset(ret, msg));
        if let Err(e) = self.writer.try_send(frame) {
            tracing::debug!(stream_id = entry.id, ret, error = %e, "RESET for abandoned call not sent");
        }
    }

    /// The error a failed local operation reports: the stream's own outcome
    /// once it has ended, otherwise `error` itself.
    fn outcome_error(&self, entry: &StreamEntry, error: StreamwireError) -> StreamwireError {
        match error {
            StreamwireError::StreamClosed(id) => entry
                .termination()
                .and_then(|t| t.to_error())
                .unwrap_or(StreamwireError::StreamClosed(id)),
            other => other,
        }
    }

    /// Refuse a frame the peer's extractor would treat as connection-fatal.
    ///
    /// Both ends are assumed to run with the same `max_frame_size`.
    fn check_frame_size(&self, payload_len: usize) -> Result<()> {
        let limit = (self.config.max_frame_size as usize).saturating_sub(HEADER_SIZE);
        if payload_len > limit {
            return Err(StreamwireError::MessageTooLarge {
                size: payload_len,
                limit: limit as i64,
            });
        }
        Ok(())
    }

    /// DATA frame for one encoded message. Nothing is reserved yet, so a
    /// rejection here leaves the stream untouched.
    fn data_frame(&self, entry: &StreamEntry, payload: Bytes) -> Result<Frame> {
        self.check_frame_size(payload.len())?;
        Frame::data(entry.id, payload).map_err(|e| match e {
            StreamwireError::EmptyData(_) => {
                StreamwireError::Encode("message encoded to zero bytes".to_string())
            }
            other => other,
        })
    }

    /// Send one DATA payload, suspending until the peer's window allows it.
    pub(crate) async fn send_data(&self, entry: &StreamEntry, payload: Bytes) -> Result<()> {
        let frame = self.data_frame(entry, payload)?;
        let size = frame.payload_len();
        let checked = entry.session().check_send();
        checked.map_err(|e| self.outcome_error(entry, e))?;

        let window = entry
            .send_window()
            .ok_or(StreamwireError::StreamClosed(entry.id))?;
        window
            .acquire(size)
            .await
            .map_err(|e| self.outcome_error(entry, e))?;

        let committed = entry.session().on_send_data();
        committed.map_err(|e| self.outcome_error(entry, e))?;
        self.write(frame).await?;
        self.settle(entry);
        Ok(())
    }

    /// Like [`send_data`](Self::send_data) but fails with `WindowExhausted`
    /// instead of waiting.
    pub(crate) fn try_send_data(&self, entry: &StreamEntry, payload: Bytes) -> Result<()> {
        let frame = self.data_frame(entry, payload)?;
        let size = frame.payload_len();
        let checked = entry.session().check_send();
        checked.map_err(|e| self.outcome_error(entry, e))?;

        let window = entry
            .send_window()
            .ok_or(StreamwireError::StreamClosed(entry.id))?;
        window
            .try_acquire(size)
            .map_err(|e| self.outcome_error(entry, e))?;
        if let Err(e) = self.writer.try_send(&frame) {
            window.refund(size);
            return Err(e);
        }

        let committed = entry.session().on_send_data();
        committed.map_err(|e| self.outcome_error(entry, e))?;
        self.settle(entry);
        Ok(())
    }

    /// Close this side's direction with `ret`.
    pub(crate) async fn send_close(&self, entry: &StreamEntry, ret: i32, msg: &str) -> Result<()> {
        let transition = entry.session().on_send_close(ret, msg);
        transition.map_err(|e| self.outcome_error(entry, e))?;
        self.settle(entry);
        self.write(Frame::close(entry.id, &StreamCloseMeta::close(ret, msg)))
            .await
    }

    /// Application consumed `size` payload bytes; return credit if due.
    pub(crate) async fn consumed(&self, entry: &StreamEntry, size: usize) {
        let increment = entry.session().on_consumed(size);
        let Some(increment) = increment else {
            return;
        };
        match Frame::feedback(entry.id, increment) {
            Ok(frame) => {
                if let Err(e) = self.write(frame).await {
                    tracing::debug!(stream_id = entry.id, error = %e, "FEEDBACK not sent");
                }
            }
            Err(e) => tracing::warn!(stream_id = entry.id, error = %e, "invalid FEEDBACK"),
        }
    }

    /// Complete a server call with the handler's result.
    ///
    /// `Ok` closes with ret 0 unless the handler already closed, an
    /// [`Rpc`](StreamwireError::Rpc) error closes with its ret, anything else
    /// resets the stream.
    pub(crate) async fn finish_server_call(&self, entry: &StreamEntry, result: Result<()>) -> Result<()> {
        let (terminal, local_done) = {
            let session = entry.session();
            (session.is_terminal(), session.is_local_done())
        };
        let open = !terminal && !local_done;
        match result {
            Ok(()) => {
                if open {
                    self.send_close(entry, ret::SUCCESS, "").await?;
                }
                Ok(())
            }
            Err(StreamwireError::Rpc { ret, msg }) => {
                if open {
                    self.send_close(entry, ret, &msg).await?;
                }
                Err(StreamwireError::Rpc { ret, msg })
            }
            Err(error) => {
                self.fail_stream(entry, &error).await;
                Err(error)
            }
        }
    }

    /// Start the deadline timer of `entry`.
    fn arm_deadline(self: &Arc<Self>, entry: &Arc<StreamEntry>, deadline: Instant) {
        let shared = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let (Some(shared), Some(entry)) = (shared.upgrade(), weak_entry.upgrade()) {
                shared.expire(&entry).await;
            }
        });
        entry.set_timer(timer.abort_handle());
    }

    async fn expire(&self, entry: &StreamEntry) {
        let fired = entry.session().check_deadline(now());
        if fired {
            self.finish(entry);
            self.write_reset(entry.id, entry.role.timeout_ret(), "stream deadline exceeded")
                .await;
        }
    }

    /// End every live stream and stop both background tasks.
    ///
    /// With `notify_peer` each stream is also reset on the wire; otherwise
    /// the streams end locally only, as when the transport is already gone.
    async fn shutdown_streams(&self, reason: &str, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<_> = self.streams().drain().map(|(_, entry)| entry).collect();
        tracing::info!(live_streams = entries.len(), reason, "connection shutting down");

        for entry in entries {
            let ret = network_ret(entry.role);
            let reset = entry
                .session()
                .reset(ret, reason, ResetOrigin::Connection);
            if !reset {
                continue;
            }
            self.finish(&entry);
            if notify_peer {
                self.write_reset(entry.id, ret, reason).await;
            }
        }
        self.shutdown.send_replace(true);
    }

    /// Answer a frame whose body could not be decoded.
    async fn reject_frame(&self, error: StreamwireError) {
        let Some(stream_id) = error.stream_id() else {
            tracing::warn!(error = %error, "undecodable frame dropped");
            return;
        };
        match self.stream(stream_id) {
            Some(entry) => self.fail_stream(&entry, &error).await,
            None => {
                tracing::debug!(stream_id, error = %error, "undecodable frame for unknown stream");
                let ret = error.ret(self.endpoint == Endpoint::Client);
                self.write_reset(stream_id, ret, &error.to_string()).await;
            }
        }
    }
}

/// Read frames until EOF, shutdown or a connection-fatal error.
async fn read_loop<R>(mut reader: R, shared: &Arc<Shared>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_frame_size(shared.config.max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read? {
                0 => return Ok(()),
                n => n,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => return Ok(()),
        };

        for decoded in frames.push(&buf[..n])? {
            match decoded {
                Ok(frame) => shared.route(frame).await,
                Err(error) => shared.reject_frame(error).await,
            }
        }
    }
}

/// A running stream connection.
///
/// Cheap to clone; every clone drives the same connection. The connection
/// keeps running until the peer disconnects, a connection-fatal error is
/// read, or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Open a stream and wait for the peer to accept it.
    async fn open<Req, Resp>(
        &self,
        options: &CallOptions,
        shape: CallShape,
    ) -> Result<(StreamSender<Req>, StreamReceiver<Resp>)>
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(StreamwireError::ConnectionClosed);
        }
        let config = &shared.config;
        let content_type = options.serialization.code();
        // Refuse locally what this side could not decode anyway.
        NegotiatedCodec::resolve(content_type, options.compression, &shared.codecs)?;

        let init = StreamInitMeta::request(
            options.init_request(),
            config.init_window_size,
            content_type,
            options.compression,
        );
        shared.check_frame_size(init.encoded_len())?;

        let stream_id = shared.allocate_stream_id()?;
        let deadline = options
            .timeout
            .or_else(|| config.stream_timeout())
            .map(|timeout| now() + timeout);
        let recv = RecvWindow::new(stream_id, config.init_window_size, config.feedback_threshold);
        let session = StreamSession::new(stream_id, Role::Client, shape, recv, deadline);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_bound());
        let (init_tx, init_rx) = oneshot::channel();
        let entry = Arc::new(StreamEntry::client(
            session,
            options.func.clone(),
            inbound_tx,
            init_tx,
            (content_type, options.compression),
        ));

        shared.insert_stream(entry.clone())?;
        // From here on, dropping this future cancels the stream.
        let guard = Arc::new(CallGuard::new(entry.clone(), shared.clone()));
        if let Some(deadline) = deadline {
            shared.arm_deadline(&entry, deadline);
        }

        shared.write(Frame::init(stream_id, &init)).await?;
        tracing::debug!(stream_id, func = %options.func, ?shape, "stream opening");

        if init_rx.await.is_err() {
            // Ended before the handshake completed: rejected, reset or timed out.
            return Err(entry
                .termination()
                .and_then(|t| t.to_error())
                .unwrap_or(StreamwireError::ConnectionClosed));
        }
        let codec = entry
            .session()
            .codec()
            .cloned()
            .ok_or(StreamwireError::StreamClosed(stream_id))?;

        let sender = StreamSender::new(entry.clone(), shared.clone(), codec.clone(), Some(guard.clone()));
        let receiver = StreamReceiver::new(entry, shared.clone(), codec, inbound_rx, Some(guard));
        Ok((sender, receiver))
    }

    /// One request, one response.
    ///
    /// A non-zero ret from the server surfaces as
    /// [`StreamwireError::Rpc`].
    pub async fn unary<Req, Resp>(&self, options: CallOptions, request: &Req) -> Result<Resp>
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        let (mut sender, receiver) = self.open::<Req, Resp>(&options, CallShape::Unary).await?;
        sender.send_or_abort(request).await?;
        receiver.into_single().await
    }

    /// A request stream answered by one response.
    pub async fn client_streaming<Req, Resp>(&self, options: CallOptions) -> Result<ClientStreamingCall<Req, Resp>>
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        let (sender, receiver) = self
            .open::<Req, Resp>(&options, CallShape::ClientStreaming)
            .await?;
        Ok(ClientStreamingCall::new(sender, receiver))
    }

    /// One request answered by a response stream.
    pub async fn server_streaming<Req, Resp>(
        &self,
        options: CallOptions,
        request: &Req,
    ) -> Result<StreamReceiver<Resp>>
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        let (mut sender, receiver) = self
            .open::<Req, Resp>(&options, CallShape::ServerStreaming)
            .await?;
        sender.send_or_abort(request).await?;
        Ok(receiver)
    }

    /// Independent message streams in both directions.
    pub async fn bidi<Req, Resp>(&self, options: CallOptions) -> Result<(StreamSender<Req>, StreamReceiver<Resp>)>
    where
        Req: StreamMessage,
        Resp: StreamMessage,
    {
        self.open(&options, CallShape::Bidi).await
    }

    /// Subscribe to stream lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Number of streams not yet closed or reset.
    pub fn live_streams(&self) -> usize {
        self.shared.streams().len()
    }

    /// Ids of the live streams, ascending.
    pub fn stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.shared.streams().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Frames queued for the writer but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    /// Counters of the server handler pool.
    pub fn worker_stats(&self) -> WorkerStats {
        self.shared.workers.stats()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Reset every live stream on the wire, flush the writer and shut the
    /// transport down. Idempotent.
    pub async fn close(&self) {
        self.shared
            .shutdown_streams("connection closed", true)
            .await;
    }

    /// Wait until the connection has shut down, for whatever reason.
    pub async fn closed(&self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        // An error means the sender is gone, which also means shut down.
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.endpoint)
            .field("live_streams", &self.live_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}
