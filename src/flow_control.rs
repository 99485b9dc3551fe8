//! Credit-based flow control.
//!
//! Each stream direction has a window in bytes:
//!
//! - [`SendWindow`] is the budget left for outbound DATA. It starts at the
//!   peer's advertised `init_window_size`, shrinks by every DATA payload sent
//!   and grows by every FEEDBACK increment received. A producer that does not
//!   fit is parked on a [`Notify`] until credit arrives; there is no polling.
//! - [`RecvWindow`] is the budget advertised to the peer. It shrinks by every
//!   DATA payload received. Bytes the application has consumed accumulate
//!   until they cross a threshold, then are returned to the peer as a single
//!   FEEDBACK increment.
//!
//! Window arithmetic is done in `i64` so cumulative grants over a long-lived
//! stream cannot overflow.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::Notify;

use crate::error::{Result, StreamwireError};

/// Default initial window advertised in INIT frames.
pub const DEFAULT_INIT_WINDOW_SIZE: u32 = 65535;

/// Default fraction of the initial window that must be consumed before a
/// FEEDBACK is emitted.
pub const DEFAULT_FEEDBACK_THRESHOLD: f64 = 0.25;

/// Outbound window of one stream.
///
/// Shared between the producer (which acquires credit) and the read loop
/// (which grants credit on FEEDBACK), so state is kept in atomics.
#[derive(Debug)]
pub struct SendWindow {
    stream_id: u32,
    /// Peer's initial window; the largest single payload that can ever fit.
    initial: i64,
    /// Remaining budget. Never negative.
    available: AtomicI64,
    /// Initial window plus every FEEDBACK increment.
    granted: AtomicI64,
    /// Total DATA payload bytes sent.
    sent: AtomicI64,
    closed: AtomicBool,
    notify: Notify,
}

impl SendWindow {
    /// Create a window from the peer's advertised initial size.
    pub fn new(stream_id: u32, initial: u32) -> Self {
        let initial = i64::from(initial);
        Self {
            stream_id,
            initial,
            available: AtomicI64::new(initial),
            granted: AtomicI64::new(initial),
            sent: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Take `size` bytes of credit without waiting.
    ///
    /// # Errors
    ///
    /// - `WindowExhausted` if the window is currently too small
    /// - `MessageTooLarge` if `size` exceeds the peer's initial window
    /// - `StreamClosed` once the window has been closed
    pub fn try_acquire(&self, size: usize) -> Result<()> {
        let needed = self.check_size(size)?;
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(StreamwireError::StreamClosed(self.stream_id));
            }
            if needed > current {
                return Err(StreamwireError::WindowExhausted);
            }
            match self.available.compare_exchange_weak(
                current,
                current - needed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.sent.fetch_add(needed, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Take `size` bytes of credit, suspending until enough FEEDBACK has
    /// arrived.
    ///
    /// Cancel-safe: dropping the future before it completes takes no credit.
    pub async fn acquire(&self, size: usize) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a grant between the check and the
            // await is not lost.
            notified.as_mut().enable();

            match self.try_acquire(size) {
                Err(StreamwireError::WindowExhausted) => {
                    tracing::trace!(
                        stream_id = self.stream_id,
                        size,
                        available = self.available(),
                        "send window exhausted, waiting for feedback"
                    );
                    notified.await;
                }
                other => return other,
            }
        }
    }

    /// Credit the window with a FEEDBACK increment and wake parked producers.
    pub fn grant(&self, increment: i32) -> Result<()> {
        if increment <= 0 {
            return Err(StreamwireError::FlowControl {
                stream_id: self.stream_id,
                reason: format!("window increment {} must be positive", increment),
            });
        }
        let increment = i64::from(increment);
        self.available.fetch_add(increment, Ordering::AcqRel);
        self.granted.fetch_add(increment, Ordering::AcqRel);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Give back credit taken for a frame that was never queued.
    pub(crate) fn refund(&self, size: usize) {
        let size = size as i64;
        self.available.fetch_add(size, Ordering::AcqRel);
        self.sent.fetch_sub(size, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Fail every current and future acquire with `StreamClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remaining credit.
    #[inline]
    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    #[inline]
    pub fn initial(&self) -> i64 {
        self.initial
    }

    /// Initial window plus every increment granted so far.
    #[inline]
    pub fn granted_total(&self) -> i64 {
        self.granted.load(Ordering::Acquire)
    }

    /// Payload bytes sent so far.
    #[inline]
    pub fn sent_total(&self) -> i64 {
        self.sent.load(Ordering::Acquire)
    }

    fn check_size(&self, size: usize) -> Result<i64> {
        let needed = i64::try_from(size).unwrap_or(i64::MAX);
        if needed > self.initial {
            return Err(StreamwireError::MessageTooLarge {
                size,
                limit: self.initial,
            });
        }
        Ok(needed)
    }
}

/// Inbound window of one stream.
///
/// Owned by the stream session, so plain integers suffice.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    stream_id: u32,
    /// Budget the peer may still use.
    available: i64,
    /// Consumed bytes not yet returned to the peer.
    unacked: i64,
    /// Emit FEEDBACK once `unacked` reaches this.
    threshold: i64,
}

impl RecvWindow {
    /// Create a window advertising `initial` bytes.
    ///
    /// `threshold_fraction` is clamped to `(0, 1]`.
    pub fn new(stream_id: u32, initial: u32, threshold_fraction: f64) -> Self {
        let fraction = if threshold_fraction.is_finite() && threshold_fraction > 0.0 {
            threshold_fraction.min(1.0)
        } else {
            DEFAULT_FEEDBACK_THRESHOLD
        };
        let initial = i64::from(initial);
        let threshold = ((initial as f64 * fraction) as i64).max(1);
        Self {
            stream_id,
            available: initial,
            unacked: 0,
            threshold,
        }
    }

    /// Account for a received DATA payload.
    ///
    /// A peer sending beyond the advertised window is a flow-control
    /// violation.
    pub fn on_data(&mut self, size: usize) -> Result<()> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        if size > self.available {
            return Err(StreamwireError::FlowControl {
                stream_id: self.stream_id,
                reason: format!(
                    "peer sent {} bytes with only {} bytes of window",
                    size, self.available
                ),
            });
        }
        self.available -= size;
        Ok(())
    }

    /// Account for bytes the application consumed.
    ///
    /// Returns the increment to send in a FEEDBACK frame once the threshold
    /// is crossed, and re-credits the advertised window by the same amount.
    pub fn on_consumed(&mut self, size: usize) -> Option<i32> {
        self.unacked += i64::try_from(size).unwrap_or(i64::MAX);
        if self.unacked < self.threshold {
            return None;
        }
        let increment = self.unacked.min(i64::from(i32::MAX));
        self.unacked -= increment;
        self.available += increment;
        // lossless: bounded by i32::MAX above
        Some(increment as i32)
    }

    #[inline]
    pub fn available(&self) -> i64 {
        self.available
    }

    #[inline]
    pub fn unacked(&self) -> i64 {
        self.unacked
    }

    #[inline]
    pub fn threshold(&self) -> i64 {
        self.threshold
    }
}
