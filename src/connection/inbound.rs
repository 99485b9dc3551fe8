//! Routing of decoded inbound frames to their streams.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::entry::InboundPush;
use super::{now, Shared, StreamEntry, StreamEvent};
use crate::codec::{NegotiatedCodec, IDENTITY};
use crate::error::{ret, StreamwireError};
use crate::flow_control::RecvWindow;
use crate::handler::{CallContext, ServerCall};
use crate::protocol::{
    Frame, FrameType, InitKind, StreamInitMeta, StreamInitRequestMeta, StreamInitResponseMeta,
};
use crate::stream::{ResetOrigin, Role, StreamSession};

fn protocol_error(stream_id: u32, reason: impl Into<String>) -> StreamwireError {
    StreamwireError::Protocol {
        stream_id,
        reason: reason.into(),
    }
}

impl Shared {
    /// Dispatch one frame. Stream-scoped failures reset that stream only.
    pub(super) async fn route(self: &Arc<Self>, frame: Frame) {
        tracing::trace!(
            stream_id = frame.stream_id(),
            frame_type = ?frame.frame_type(),
            len = frame.payload_len(),
            "frame received"
        );
        match frame.frame_type() {
            FrameType::Init => self.on_init(frame).await,
            FrameType::Data => self.on_data(frame).await,
            FrameType::Feedback => self.on_feedback(frame).await,
            FrameType::Close => self.on_close(frame).await,
        }
    }

    async fn on_init(self: &Arc<Self>, frame: Frame) {
        let stream_id = frame.stream_id();
        let meta = match frame.init_meta() {
            Ok(meta) => meta,
            Err(e) => return self.reject_frame(e).await,
        };
        let StreamInitMeta {
            kind,
            init_window_size,
            content_type,
            content_encoding,
        } = meta;

        match kind {
            Some(InitKind::Request(request)) => {
                self.accept_stream(stream_id, request, init_window_size, content_type, content_encoding)
                    .await
            }
            Some(InitKind::Response(response)) => {
                self.complete_handshake(stream_id, response, init_window_size, content_type, content_encoding)
                    .await
            }
            None => {
                self.reject_frame(protocol_error(stream_id, "INIT without request or response"))
                    .await
            }
        }
    }

    async fn reject_init(&self, stream_id: u32, ret: i32, msg: &str) {
        let frame = Frame::init(stream_id, &StreamInitMeta::rejected(ret, msg));
        if let Err(e) = self.write(frame).await {
            tracing::debug!(stream_id, error = %e, "INIT rejection not sent");
        }
    }

    /// Peer opened a stream.
    async fn accept_stream(
        self: &Arc<Self>,
        stream_id: u32,
        request: StreamInitRequestMeta,
        peer_window: i32,
        content_type: i32,
        content_encoding: i32,
    ) {
        if self.is_closed() {
            return;
        }
        if let Some(existing) = self.stream(stream_id) {
            return self
                .fail_stream(&existing, &protocol_error(stream_id, "duplicate INIT request"))
                .await;
        }

        let func = request.func_name();
        let Some((shape, handler)) = self.services.as_deref().and_then(|s| s.lookup(&func)) else {
            tracing::debug!(stream_id, func = %func, "no handler registered");
            return self
                .reject_init(stream_id, ret::SERVER_NO_FUNC, &format!("no handler for {}", func))
                .await;
        };

        let codec = match NegotiatedCodec::negotiate(content_type, content_encoding, &self.codecs) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::warn!(stream_id, func = %func, error = %e, "codec negotiation failed");
                return self.write_reset(stream_id, e.ret(false), &e.to_string()).await;
            }
        };
        let peer_window = match u32::try_from(peer_window) {
            Ok(window) if window > 0 => window,
            _ => {
                return self
                    .write_reset(stream_id, ret::STREAM_UNKNOWN, "init window must be positive")
                    .await
            }
        };

        let Some(permit) = self.workers.try_reserve() else {
            tracing::warn!(
                stream_id,
                func = %func,
                capacity = self.workers.capacity(),
                "handler pool saturated, rejecting stream"
            );
            return self
                .reject_init(stream_id, ret::SERVER_OVERLOAD, "server overloaded")
                .await;
        };

        let deadline = self.config.stream_timeout().map(|timeout| now() + timeout);
        let recv = RecvWindow::new(stream_id, self.config.init_window_size, self.config.feedback_threshold);
        let mut session = StreamSession::new(stream_id, Role::Server, shape, recv, deadline);
        if let Err(e) = session.establish(codec.clone()) {
            return self.write_reset(stream_id, e.ret(false), &e.to_string()).await;
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_bound());
        let entry = Arc::new(StreamEntry::server(session, func.clone(), inbound_tx));
        entry.open_send_window(peer_window);
        if let Err(e) = self.insert_stream(entry.clone()) {
            tracing::debug!(stream_id, error = %e, "stream not accepted");
            return;
        }

        let accepted = StreamInitMeta::accepted(
            self.config.init_window_size,
            codec.content_type(),
            codec.content_encoding(),
        );
        if let Err(e) = self.write(Frame::init(stream_id, &accepted)).await {
            tracing::debug!(stream_id, error = %e, "INIT response not sent");
            return;
        }
        tracing::debug!(
            stream_id,
            func = %func,
            ?shape,
            serialization = codec.serialization().as_str(),
            content_encoding = codec.content_encoding(),
            "stream accepted"
        );
        self.emit(StreamEvent::Opened {
            stream_id,
            func,
            role: Role::Server,
        });
        if let Some(deadline) = deadline {
            self.arm_deadline(&entry, deadline);
        }

        let ctx = CallContext::from_request(stream_id, &request, deadline, &codec);
        let call = ServerCall::new(ctx, entry, self.clone(), inbound_rx, codec);
        self.workers.spawn(permit, handler.call(call));
    }

    /// Peer answered a stream this side opened.
    async fn complete_handshake(
        self: &Arc<Self>,
        stream_id: u32,
        response: StreamInitResponseMeta,
        peer_window: i32,
        content_type: i32,
        content_encoding: i32,
    ) {
        let Some(entry) = self.stream(stream_id) else {
            tracing::debug!(stream_id, "INIT response for unknown stream");
            return self
                .write_reset(stream_id, ret::STREAM_UNKNOWN, "unknown stream")
                .await;
        };
        let Some((proposed_type, proposed_encoding)) = entry.proposal else {
            return self
                .fail_stream(&entry, &protocol_error(stream_id, "INIT response on an accepted stream"))
                .await;
        };

        if response.ret != ret::SUCCESS {
            let msg = String::from_utf8_lossy(&response.error_msg).into_owned();
            tracing::debug!(stream_id, ret = response.ret, msg = %msg, "stream rejected");
            let rejected = entry.session().reject(response.ret, msg);
            return match rejected {
                Ok(()) => self.finish(&entry),
                Err(e) => self.fail_stream(&entry, &e).await,
            };
        }

        // The server may only drop compression, never change serialization.
        if content_type != proposed_type {
            return self
                .fail_stream(&entry, &StreamwireError::UnsupportedSerialization(content_type))
                .await;
        }
        if content_encoding != proposed_encoding && content_encoding != IDENTITY {
            return self
                .fail_stream(&entry, &StreamwireError::UnsupportedCompression(content_encoding))
                .await;
        }
        let codec = match NegotiatedCodec::resolve(content_type, content_encoding, &self.codecs) {
            Ok(codec) => codec,
            Err(e) => return self.fail_stream(&entry, &e).await,
        };
        let peer_window = match u32::try_from(peer_window) {
            Ok(window) if window > 0 => window,
            _ => {
                return self
                    .fail_stream(&entry, &protocol_error(stream_id, "init window must be positive"))
                    .await
            }
        };

        let established = entry.session().establish(codec);
        if let Err(e) = established {
            return self.fail_stream(&entry, &e).await;
        }
        entry.open_send_window(peer_window);
        entry.signal_established();
        tracing::debug!(stream_id, func = %entry.func, peer_window, "stream established");
        self.emit(StreamEvent::Opened {
            stream_id,
            func: entry.func.clone(),
            role: Role::Client,
        });
    }

    async fn on_data(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(entry) = self.stream(stream_id) else {
            tracing::debug!(stream_id, "DATA for unknown stream");
            return self
                .write_reset(stream_id, ret::STREAM_UNKNOWN, "unknown stream")
                .await;
        };

        let size = frame.payload_len();
        let accepted = entry.session().on_recv_data(size);
        if let Err(e) = accepted {
            return self.fail_stream(&entry, &e).await;
        }
        match entry.push_inbound(frame.payload_bytes()) {
            InboundPush::Queued => {}
            InboundPush::Full => {
                return self
                    .fail_stream(&entry, &StreamwireError::QueueOverflow(stream_id))
                    .await;
            }
            // Nobody will read it, so credit it straight away.
            InboundPush::Gone => self.consumed(&entry, size).await,
        }
        self.emit(StreamEvent::Data { stream_id, size });
        self.after_remote_transition(&entry);
    }

    async fn on_feedback(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let Some(entry) = self.stream(stream_id) else {
            tracing::debug!(stream_id, "FEEDBACK for unknown stream");
            return self
                .write_reset(stream_id, ret::STREAM_UNKNOWN, "unknown stream")
                .await;
        };

        let increment = match frame.feedback_increment() {
            Ok(increment) => increment,
            Err(e) => return self.fail_stream(&entry, &e).await,
        };
        let Some(window) = entry.send_window() else {
            return self
                .fail_stream(&entry, &protocol_error(stream_id, "FEEDBACK before INIT completed"))
                .await;
        };
        if let Err(e) = window.grant(increment) {
            return self.fail_stream(&entry, &e).await;
        }
        tracing::trace!(stream_id, increment, available = window.available(), "window granted");
        self.emit(StreamEvent::Feedback {
            stream_id,
            increment,
        });
    }

    async fn on_close(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let meta = match frame.close_meta() {
            Ok(meta) => meta,
            Err(e) => return self.reject_frame(e).await,
        };
        let Some(entry) = self.stream(stream_id) else {
            // Late CLOSE after a local reset or timeout.
            tracing::debug!(stream_id, ret = meta.ret, reset = meta.is_reset(), "CLOSE for unknown stream ignored");
            return;
        };

        if meta.is_reset() {
            let reset = entry
                .session()
                .reset(meta.ret, meta.message(), ResetOrigin::Peer);
            if reset {
                self.finish(&entry);
            }
            return;
        }

        let closed = entry.session().on_recv_close(meta.ret, meta.message());
        if let Err(e) = closed {
            return self.fail_stream(&entry, &e).await;
        }
        self.after_remote_transition(&entry);
    }

    /// Propagate a peer-driven transition: end the inbound queue once the
    /// peer is done, and finish the stream once both sides are.
    fn after_remote_transition(&self, entry: &StreamEntry) {
        let (terminal, remote_done) = {
            let session = entry.session();
            (session.is_terminal(), session.is_remote_done())
        };
        if terminal {
            self.finish(entry);
        } else if remote_done {
            entry.close_inbound();
        }
    }
}
