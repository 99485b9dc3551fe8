//! Per-stream state machine.
//!
//! [`StreamSession`] performs no I/O. The connection feeds it every local
//! action and every inbound frame for its stream id; the session validates
//! the transition against the state and call shape, updates the receive
//! window, and records how the stream ended. Frames are emitted by the
//! caller after a transition succeeds.

use std::time::Instant;

use super::state::{CallShape, ResetOrigin, Role, StreamState, Termination};
use crate::codec::NegotiatedCodec;
use crate::error::{ret, Result, StreamwireError};
use crate::flow_control::RecvWindow;

/// Lifecycle, codec and inbound window of one stream.
#[derive(Debug)]
pub struct StreamSession {
    id: u32,
    role: Role,
    shape: CallShape,
    state: StreamState,
    deadline: Option<Instant>,
    codec: Option<NegotiatedCodec>,
    recv: RecvWindow,
    local_done: bool,
    remote_done: bool,
    sent_messages: u64,
    received_messages: u64,
    /// ret/msg of the CLOSE that finished the server's direction.
    server_verdict: Option<(i32, String)>,
    termination: Option<Termination>,
}

impl StreamSession {
    /// New session in `HANDSHAKING`.
    pub fn new(
        id: u32,
        role: Role,
        shape: CallShape,
        recv: RecvWindow,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            id,
            role,
            shape,
            state: StreamState::Handshaking,
            deadline,
            codec: None,
            recv,
            local_done: false,
            remote_done: false,
            sent_messages: 0,
            received_messages: 0,
            server_verdict: None,
            termination: None,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Codec fixed by the INIT exchange, once established.
    pub fn codec(&self) -> Option<&NegotiatedCodec> {
        self.codec.as_ref()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Local direction has finished sending.
    #[inline]
    pub fn is_local_done(&self) -> bool {
        self.local_done
    }

    /// Peer has finished sending.
    #[inline]
    pub fn is_remote_done(&self) -> bool {
        self.remote_done
    }

    pub fn recv_window(&self) -> &RecvWindow {
        &self.recv
    }

    /// INIT exchange succeeded with `codec`.
    ///
    /// For the client this is the accepted INIT response; for the server,
    /// sending one.
    pub fn establish(&mut self, codec: NegotiatedCodec) -> Result<()> {
        if self.state != StreamState::Handshaking {
            return Err(self.violation(format!("INIT completed in state {}", self.state)));
        }
        self.codec = Some(codec);
        self.state = StreamState::Established;
        Ok(())
    }

    /// INIT response carried a non-zero ret. The stream ends without ever
    /// being established.
    pub fn reject(&mut self, ret: i32, msg: impl Into<String>) -> Result<()> {
        if self.state != StreamState::Handshaking {
            return Err(self.violation(format!("INIT rejected in state {}", self.state)));
        }
        self.finish(
            StreamState::Closed,
            Termination::Closed {
                ret,
                msg: msg.into(),
            },
        );
        Ok(())
    }

    /// Whether one more DATA message may be sent, without recording it.
    pub fn check_send(&self) -> Result<()> {
        if self.local_done || !self.state.can_send() {
            return Err(StreamwireError::StreamClosed(self.id));
        }
        if self.sends_single() && self.sent_messages >= 1 {
            return Err(self.violation(format!("{:?} call sends a single message", self.shape)));
        }
        Ok(())
    }

    /// Local side is about to send one DATA message.
    pub fn on_send_data(&mut self) -> Result<()> {
        self.check_send()?;
        self.sent_messages += 1;
        if self.role == Role::Client && self.shape.single_request() {
            self.mark_local_done();
        }
        Ok(())
    }

    /// Local side is about to send CLOSE with `ret`.
    ///
    /// A non-zero ret ends the stream immediately, mirroring how the peer
    /// treats it on receipt.
    pub fn on_send_close(&mut self, ret: i32, msg: &str) -> Result<()> {
        if self.local_done || self.state.is_terminal() || self.state == StreamState::Handshaking {
            return Err(StreamwireError::StreamClosed(self.id));
        }
        if ret != ret::SUCCESS {
            self.local_done = true;
            self.remote_done = true;
            self.finish(
                StreamState::Closed,
                Termination::Closed {
                    ret,
                    msg: msg.to_string(),
                },
            );
            return Ok(());
        }
        if self.role == Role::Server {
            self.server_verdict = Some((ret, msg.to_string()));
        }
        self.mark_local_done();
        Ok(())
    }

    /// DATA frame with `size` payload bytes arrived.
    pub fn on_recv_data(&mut self, size: usize) -> Result<()> {
        if self.remote_done || !self.state.can_recv() {
            return Err(self.violation(format!("DATA received in state {}", self.state)));
        }
        if self.receives_single() && self.received_messages >= 1 {
            return Err(self.violation(format!(
                "{:?} call expects a single message from the peer",
                self.shape
            )));
        }
        self.recv.on_data(size)?;
        self.received_messages += 1;
        if self.role == Role::Server && self.shape.single_request() {
            self.mark_remote_done();
        }
        Ok(())
    }

    /// Graceful CLOSE arrived.
    ///
    /// A CLOSE carrying a non-zero ret ends the stream immediately, whatever
    /// the local direction is doing.
    pub fn on_recv_close(&mut self, ret: i32, msg: String) -> Result<()> {
        if self.remote_done || self.state.is_terminal() || self.state == StreamState::Handshaking {
            return Err(self.violation(format!("CLOSE received in state {}", self.state)));
        }
        if self.role == Role::Client {
            self.server_verdict = Some((ret, msg.clone()));
        }
        if ret != ret::SUCCESS {
            self.local_done = true;
            self.remote_done = true;
            self.finish(StreamState::Closed, Termination::Closed { ret, msg });
            return Ok(());
        }
        self.mark_remote_done();
        Ok(())
    }

    /// Application consumed `size` bytes of received payload.
    ///
    /// Returns the FEEDBACK increment to send, if the threshold was crossed
    /// and the peer can still use the credit.
    pub fn on_consumed(&mut self, size: usize) -> Option<i32> {
        if self.remote_done || self.state.is_terminal() {
            return None;
        }
        self.recv.on_consumed(size)
    }

    /// Abort the stream. Returns `false` if it had already ended.
    pub fn reset(&mut self, ret: i32, msg: impl Into<String>, origin: ResetOrigin) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.finish(
            StreamState::Reset,
            Termination::Reset {
                ret,
                msg: msg.into(),
                origin,
            },
        );
        true
    }

    /// Reset the stream if its deadline has passed.
    ///
    /// Returns `true` exactly once: on the check that performs the reset.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => self.reset(
                self.role.timeout_ret(),
                "stream deadline exceeded",
                ResetOrigin::Timeout,
            ),
            _ => false,
        }
    }

    fn sends_single(&self) -> bool {
        match self.role {
            Role::Client => self.shape.single_request(),
            Role::Server => self.shape.single_response(),
        }
    }

    fn receives_single(&self) -> bool {
        match self.role {
            Role::Client => self.shape.single_response(),
            Role::Server => self.shape.single_request(),
        }
    }

    fn mark_local_done(&mut self) {
        self.local_done = true;
        if self.remote_done {
            self.close_gracefully();
        } else {
            self.state = StreamState::HalfClosedLocal;
        }
    }

    fn mark_remote_done(&mut self) {
        self.remote_done = true;
        if self.local_done {
            self.close_gracefully();
        } else {
            self.state = StreamState::HalfClosedRemote;
        }
    }

    fn close_gracefully(&mut self) {
        let (ret, msg) = self
            .server_verdict
            .take()
            .unwrap_or((ret::SUCCESS, String::new()));
        self.finish(StreamState::Closed, Termination::Closed { ret, msg });
    }

    fn finish(&mut self, state: StreamState, termination: Termination) {
        self.state = state;
        self.termination = Some(termination);
    }

    fn violation(&self, reason: String) -> StreamwireError {
        StreamwireError::Protocol {
            stream_id: self.id,
            reason,
        }
    }
}
