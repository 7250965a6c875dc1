//! Per-connection socket writer.
//!
//! Every connection owns one writer task that receives frames via an mpsc
//! channel. Callers, the read loop and server workers all share a cloned
//! [`WriterHandle`] instead of locking the socket, and the task batches
//! whatever is queued into a single `write_vectored` call.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Worker N ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{HighwayError, Result};
use crate::protocol::{Frame, ENVELOPE_SIZE};

/// Queued frames at which senders start waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Bound of the writer's mpsc queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout in milliseconds.
pub const DEFAULT_BACKPRESSURE_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on frames gathered into one `write_vectored` pass.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded envelope.
    pub envelope: [u8; ENVELOPE_SIZE],
    /// Encoded header segment.
    pub header: Bytes,
    /// Encoded body segment, empty for void.
    pub body: Bytes,
}

impl OutboundFrame {
    /// Prepare a frame for writing.
    ///
    /// Fails with an `Encode` error if the frame does not fit the length field.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let envelope = frame.envelope()?.encode();
        Ok(Self {
            envelope,
            header: frame.header,
            body: frame.body,
        })
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        ENVELOPE_SIZE + self.header.len() + self.body.len()
    }

    #[inline]
    fn segments(&self) -> [&[u8]; 3] {
        [&self.envelope, &self.header, &self.body]
    }
}

/// Writer tuning shared by client and server connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Queued frames at which `send` starts waiting.
    pub max_pending_frames: usize,
    /// Bound of the mpsc queue feeding the task.
    pub channel_capacity: usize,
    /// How long `send` waits for the queue to drain before failing
    /// with `Backpressure`.
    pub backpressure_timeout_ms: u64,
}

impl WriterConfig {
    /// Backpressure timeout as a `Duration`.
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT_MS,
        }
    }
}

/// Cloneable sender side of a connection's writer.
///
/// Request callers, the read loop and server workers each hold one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Queue a frame for the socket.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration. Cancel-safe: a dropped `send` leaves nothing queued.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let frame = OutboundFrame::from_frame(frame)?;

        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        let permit = self.tx.reserve().await.map_err(|_| {
            HighwayError::TransportFailure("Connection writer closed".into())
        })?;

        // Count before handing over so the writer never decrements below zero
        self.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(frame);
        Ok(())
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if self.tx.is_closed() {
                return Err(HighwayError::TransportFailure(
                    "Connection writer closed".into(),
                ));
            }

            if start.elapsed() > self.timeout {
                return Err(HighwayError::Backpressure);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// True while senders are being held back.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the writer task has stopped (socket error or shutdown).
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Start the writer for `writer` and hand back its sender and join handle.
///
/// The task ends cleanly once every handle is dropped, or with an error if
/// the socket fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout(),
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!(error = %e, "Writer task failed");
            // Dropping the receiver fails every queued and future send.
            rx.close();
            return Err(e);
        }

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Flush `batch` with vectored writes, resuming after short writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(HighwayError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for everything after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for frame in batch {
        for segment in frame.segments() {
            if segment.is_empty() {
                continue;
            }

            let end = offset + segment.len();
            if skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&segment[start..]));
            }
            offset = end;
        }
    }

    slices
}
