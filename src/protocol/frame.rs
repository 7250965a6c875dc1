//! Frame struct with typed accessors.
//!
//! Represents a complete Highway frame: message id plus header and body
//! segments. Uses `bytes::Bytes` so both segments share the read buffer.
//!
//! # Example
//!
//! ```
//! use highway_transport::protocol::Frame;
//! use bytes::Bytes;
//!
//! let frame = Frame::new(7, Bytes::from_static(b"hdr"), Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.msg_id(), 7);
//! assert_eq!(frame.body(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Envelope, ENVELOPE_SIZE};
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id.
    pub msg_id: u64,
    /// Encoded header record (request, response or login header).
    pub header: Bytes,
    /// Encoded body (arguments, result or login payload). Empty for void.
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame from its segments.
    pub fn new(msg_id: u64, header: Bytes, body: Bytes) -> Self {
        Self {
            msg_id,
            header,
            body,
        }
    }

    /// Get the message id.
    #[inline]
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }

    /// Get a reference to the header bytes.
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Check if the body is empty (void).
    #[inline]
    pub fn is_void(&self) -> bool {
        self.body.is_empty()
    }

    /// Envelope describing this frame.
    pub fn envelope(&self) -> Result<Envelope> {
        Envelope::for_segments(self.msg_id, self.header.len(), self.body.len())
    }

    /// Size of this frame on the wire.
    #[inline]
    pub fn wire_size(&self) -> usize {
        ENVELOPE_SIZE + self.header.len() + self.body.len()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Writes the envelope, then the header segment, then the body.
/// The writer task uses scatter/gather I/O instead; this is for tests
/// and tools that need contiguous bytes.
///
/// # Example
///
/// ```
/// use highway_transport::protocol::{build_frame, ENVELOPE_SIZE};
///
/// let bytes = build_frame(1, b"hdr", b"hello").unwrap();
/// assert_eq!(bytes.len(), ENVELOPE_SIZE + 3 + 5);
/// ```
pub fn build_frame(msg_id: u64, header: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let envelope = Envelope::for_segments(msg_id, header.len(), body.len())?;
    let mut buf = Vec::with_capacity(ENVELOPE_SIZE + header.len() + body.len());
    buf.extend_from_slice(&envelope.encode());
    buf.extend_from_slice(header);
    buf.extend_from_slice(body);
    Ok(buf)
}
