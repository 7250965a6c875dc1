//! Async frame source over the read half of a connection.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::protocol::{Frame, FrameBuffer};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads frames one at a time from a byte stream.
///
/// `next_frame` is cancel-safe: its only await point is the socket read,
/// and bytes are handed to the frame buffer only after that read returns.
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader`, rejecting frames larger than `max_frame_size`.
    pub fn new(reader: R, max_frame_size: u32) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Next complete frame, or `None` once the peer has closed the stream.
    ///
    /// # Errors
    ///
    /// I/O errors, and `Protocol` errors for a corrupt length field. Both
    /// leave the stream unusable.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        buffered = self.buffer.len(),
                        "Stream closed mid-frame"
                    );
                }
                return Ok(None);
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }
}
