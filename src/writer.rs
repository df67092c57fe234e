//! Per-connection writer task.
//!
//! Responses are produced on whatever thread the service completes on, so no
//! completion ever touches the socket directly. Each connection owns one
//! writer task fed by an mpsc channel; completions only enqueue.
//!
//! ```text
//! completion 1 ─┐
//! completion 2 ─┼─► mpsc::Sender<OutboundFrame> ─► writer task ─► socket
//! completion N ─┘
//! ```
//!
//! Frames already queued are batched into one vectored write.
//!
//! [`WriterHandle::close`] abandons the connection: the task stops at once,
//! even in the middle of a write, and drops its half of the stream.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinatorError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    #[inline]
    pub fn empty(header: &Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum frames queued but not yet written.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long `send` waits for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Cheaply cloneable handle for sending frames to one connection's writer.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    max_pending: usize,
    timeout: Duration,
    closed: CancellationToken,
}

impl WriterHandle {
    /// Send a frame, waiting up to the configured timeout while the
    /// connection is backpressured.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(CoordinatorError::ConnectionClosed);
        }
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            CoordinatorError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let wait = async {
            loop {
                let drained = self.drained.notified();
                if self.pending.load(Ordering::Acquire) < self.max_pending {
                    return;
                }
                drained.await;
            }
        };

        tokio::select! {
            _ = self.closed.cancelled() => Err(CoordinatorError::ConnectionClosed),
            waited = tokio::time::timeout(self.timeout, wait) => {
                waited.map_err(|_| CoordinatorError::BackpressureTimeout)
            }
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has gone away or [`close`](Self::close)
    /// was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Stop the writer task without flushing what is still queued.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the writer is closed, or its task has ended.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly when every handle is dropped, or with an error
/// when the socket write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());
    let closed = CancellationToken::new();

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        drained: drained.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
        closed: closed.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending, drained, closed));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    closed: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let _closed_on_exit = closed.clone().drop_guard();
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let first = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(CoordinatorError::ConnectionClosed),
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let written = batch.len();
        let result = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(CoordinatorError::ConnectionClosed),
            result = write_batch(&mut writer, &batch) => result,
        };
        batch.clear();

        pending.fetch_sub(written, Ordering::Release);
        drained.notify_waiters();
        result?;
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with vectored I/O, continuing after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(CoordinatorError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` of the batch.
fn remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}
