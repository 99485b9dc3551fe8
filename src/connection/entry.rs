//! Shared per-stream record held by the stream table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::flow_control::SendWindow;
use crate::stream::{Role, StreamSession, Termination};

/// Result of handing a DATA payload to the application queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundPush {
    Queued,
    /// Queue at capacity.
    Full,
    /// Application dropped its receiver, or the peer already finished.
    Gone,
}

/// One live stream: its session plus the channels that connect the read
/// loop, the application and the deadline timer.
///
/// Locks are never held across an `.await`.
pub(crate) struct StreamEntry {
    pub(crate) id: u32,
    pub(crate) role: Role,
    pub(crate) func: String,
    /// `(content_type, content_encoding)` this side proposed, client only.
    pub(crate) proposal: Option<(i32, i32)>,
    session: Mutex<StreamSession>,
    send_window: OnceLock<SendWindow>,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    init_tx: Mutex<Option<oneshot::Sender<()>>>,
    outcome: watch::Sender<Option<Termination>>,
    timer: Mutex<Option<AbortHandle>>,
    completed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamEntry {
    /// Entry for a stream this side opened.
    pub(crate) fn client(
        session: StreamSession,
        func: String,
        inbound: mpsc::Sender<Bytes>,
        init_tx: oneshot::Sender<()>,
        proposal: (i32, i32),
    ) -> Self {
        Self::new(session, func, inbound, Some(init_tx), Some(proposal))
    }

    /// Entry for a stream the peer opened.
    pub(crate) fn server(session: StreamSession, func: String, inbound: mpsc::Sender<Bytes>) -> Self {
        Self::new(session, func, inbound, None, None)
    }

    fn new(
        session: StreamSession,
        func: String,
        inbound: mpsc::Sender<Bytes>,
        init_tx: Option<oneshot::Sender<()>>,
        proposal: Option<(i32, i32)>,
    ) -> Self {
        Self {
            id: session.id(),
            role: session.role(),
            func,
            proposal,
            session: Mutex::new(session),
            send_window: OnceLock::new(),
            inbound: Mutex::new(Some(inbound)),
            init_tx: Mutex::new(init_tx),
            outcome: watch::channel(None).0,
            timer: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, StreamSession> {
        lock(&self.session)
    }

    /// Install the peer's window. Later calls are ignored.
    pub(crate) fn open_send_window(&self, initial: u32) {
        let _ = self.send_window.set(SendWindow::new(self.id, initial));
    }

    pub(crate) fn send_window(&self) -> Option<&SendWindow> {
        self.send_window.get()
    }

    pub(crate) fn push_inbound(&self, payload: Bytes) -> InboundPush {
        let guard = lock(&self.inbound);
        let Some(tx) = guard.as_ref() else {
            return InboundPush::Gone;
        };
        match tx.try_send(payload) {
            Ok(()) => InboundPush::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => InboundPush::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => InboundPush::Gone,
        }
    }

    /// No more DATA will be delivered; the receiver drains and then sees end
    /// of stream.
    pub(crate) fn close_inbound(&self) {
        lock(&self.inbound).take();
    }

    /// Wake the opener once the INIT response was accepted.
    pub(crate) fn signal_established(&self) {
        if let Some(tx) = lock(&self.init_tx).take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn set_timer(&self, timer: AbortHandle) {
        if let Some(previous) = lock(&self.timer).replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn termination(&self) -> Option<Termination> {
        self.outcome.borrow().clone()
    }

    /// Wait until the stream has ended.
    pub(crate) async fn terminated(&self) -> Option<Termination> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok()?.clone();
        outcome
    }

    /// Publish the outcome and release everything waiting on the stream.
    ///
    /// Returns `false` if the stream had already been completed.
    pub(crate) fn complete(&self, termination: Termination) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outcome.send_replace(Some(termination));
        if let Some(window) = self.send_window.get() {
            window.close();
        }
        self.close_inbound();
        lock(&self.init_tx).take();
        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        true
    }
}

impl std::fmt::Debug for StreamEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("func", &self.func)
            .field("state", &self.session().state())
            .finish()
    }
}
