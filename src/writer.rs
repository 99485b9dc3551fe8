//! Dedicated writer task for high-throughput frame sending.
//!
//! Every stream of a connection funnels its frames through one mpsc channel
//! into a single writer task, which batches whatever is ready into one
//! vectored write. Frame order per sender is preserved; frames of different
//! streams interleave.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! Stream N ─┘
//! ```
//!
//! The channel is bounded, so a slow socket suspends producers in `send`.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, StreamwireError};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum frames batched into one write.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded 16-byte header.
    pub header: [u8; HEADER_SIZE],
    /// Body bytes (may be empty for CLOSE frames with default fields).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<&Frame> for OutboundFrame {
    fn from(frame: &Frame) -> Self {
        Self {
            header: frame.header().encode(),
            payload: frame.payload_bytes(),
        }
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self::from(&frame)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Maximum frames per vectored write.
    pub max_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and shared by every stream of a connection.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<AtomicUsize>) -> Self {
        Self { tx, pending }
    }

    /// Queue a frame, waiting while the channel is full.
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame.into()).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            StreamwireError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(WindowExhausted)` immediately if the channel is full.
    pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame.into()).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => StreamwireError::WindowExhausted,
                mpsc::error::TrySendError::Closed(_) => StreamwireError::ConnectionClosed,
            }
        })
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or `shutdown` turns `true`.
/// On shutdown, frames already queued are still written before the socket
/// is shut down.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    shutdown: watch::Receiver<bool>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone());
    let task = tokio::spawn(writer_loop(
        rx,
        writer,
        pending,
        config.max_batch_size.max(1),
        shutdown,
    ));

    (handle, task)
}

/// Main writer loop - receives frames and writes them out in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    max_batch: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(max_batch);
    loop {
        let stopping = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(f) => {
                    batch.push(f);
                    false
                }
                None => true,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => true,
        };

        // Collect additional ready frames (non-blocking)
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let batch_size = batch.len();
            write_batch(&mut writer, &batch).await?;
            pending.fetch_sub(batch_size, Ordering::Release);
            batch.clear();
        }

        if stopping {
            // Drain what was queued before the stop signal.
            while let Ok(frame) = rx.try_recv() {
                batch.push(frame);
                if batch.len() == max_batch {
                    write_batch(&mut writer, &batch).await?;
                    pending.fetch_sub(batch.len(), Ordering::Release);
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                write_batch(&mut writer, &batch).await?;
                pending.fetch_sub(batch.len(), Ordering::Release);
            }
            rx.close();
            let _ = writer.shutdown().await;
            tracing::debug!("writer task stopped");
            return Ok(());
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(StreamwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data left after `skip_bytes` were written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}
