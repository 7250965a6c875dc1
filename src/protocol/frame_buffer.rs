//! Incremental frame delimiting over an arbitrary byte stream.
//!
//! Socket reads land in a `BytesMut`; complete frames are split off without
//! copying. Parsing alternates between two states:
//! - `WaitingForEnvelope`: fewer than 16 bytes of the next frame are buffered
//! - `WaitingForSegments`: the envelope is known, header and body are pending
//!
//! The buffer only delimits frames; it never looks inside the header or body.
//!
//! # Example
//!
//! ```ignore
//! use highway_transport::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // `chunk` is whatever the last socket read returned
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("Got frame with msg_id: {}", frame.msg_id());
//! }
//! ```

use bytes::BytesMut;

use super::wire_format::{Envelope, DEFAULT_MAX_FRAME_SIZE, ENVELOPE_SIZE};
use super::Frame;
use crate::error::Result;

/// Where the parser stands within the current frame.
#[derive(Debug, Clone)]
enum State {
    /// The 16-byte envelope is not complete yet.
    WaitingForEnvelope,
    /// Lengths are known; `totalLength - 8` more bytes are expected.
    WaitingForSegments { envelope: Envelope },
}

/// Accumulates inbound bytes and yields whole frames in stream order.
///
/// Once `push` returns an error the stream is misaligned and the owning
/// connection must be closed; the buffer is not usable afterwards.
pub struct FrameBuffer {
    /// Bytes not yet consumed by a frame.
    buffer: BytesMut,
    /// Parser position.
    state: State,
    /// Maximum allowed `totalLength`.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Buffer with a 64KB initial capacity and the 64MB frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with custom max frame size.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForEnvelope,
            max_frame_size,
        }
    }

    /// Append a chunk and split off every frame it completes.
    ///
    /// Returns the frames completed by this chunk, in stream order. Partial
    /// data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a `Protocol` error if an envelope carries an impossible
    /// length. The connection cannot recover from this.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Split off the next frame if all of its bytes are present.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a malformed length field
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForEnvelope => {
                    let envelope = match Envelope::decode(&self.buffer) {
                        Some(envelope) => envelope,
                        None => return Ok(None),
                    };

                    envelope.validate(self.max_frame_size)?;

                    let _ = self.buffer.split_to(ENVELOPE_SIZE);
                    self.state = State::WaitingForSegments { envelope };
                }

                State::WaitingForSegments { envelope } => {
                    let envelope = *envelope;
                    if self.buffer.len() < envelope.segments_length() {
                        // Reserve the rest of the frame up front so large
                        // bodies don't grow the buffer chunk by chunk.
                        self.buffer
                            .reserve(envelope.segments_length() - self.buffer.len());
                        return Ok(None);
                    }

                    let header = self
                        .buffer
                        .split_to(envelope.header_length as usize)
                        .freeze();
                    let body = self.buffer.split_to(envelope.body_length()).freeze();

                    self.state = State::WaitingForEnvelope;

                    return Ok(Some(Frame::new(envelope.msg_id, header, body)));
                }
            }
        }
    }

    /// Bytes held for a frame still in progress.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is held.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial frame and start over at an envelope.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForEnvelope;
    }

    /// State label for log output.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForEnvelope => "WaitingForEnvelope",
            State::WaitingForSegments { .. } => "WaitingForSegments",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
