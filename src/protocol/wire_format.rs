//! Wire envelope encoding and decoding.
//!
//! Every Highway frame starts with a 16-byte envelope:
//! ```text
//! ┌─────────────┬──────────────┬──────────┬──────────────┬────────────┐
//! │ totalLength │ headerLength │ messageId│ headerBytes  │ bodyBytes  │
//! │ 4 bytes     │ 4 bytes      │ 8 bytes  │ headerLength │ remainder  │
//! │ uint32 BE   │ uint32 BE    │ uint64 BE│              │            │
//! └─────────────┴──────────────┴──────────┴──────────────┴────────────┘
//! ```
//!
//! `totalLength` counts the message id and both segments, so the body is
//! `totalLength - headerLength - 8` bytes long and may be empty.
//!
//! All multi-byte integers are Big Endian.

use crate::error::{HighwayError, Result};

/// Envelope size in bytes (fixed, exactly 16).
pub const ENVELOPE_SIZE: usize = 16;

/// Bytes counted by `totalLength` before the header segment starts
/// (the message id).
pub const ENVELOPE_TAIL_SIZE: u32 = 8;

/// Default maximum frame size (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Absolute maximum frame size. Larger values would read as negative on
/// peers that treat the length field as a signed 32-bit integer.
pub const ABSOLUTE_MAX_FRAME_SIZE: u32 = i32::MAX as u32;

/// Decoded frame envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Length of the message id plus both segments.
    pub total_length: u32,
    /// Length of the header segment.
    pub header_length: u32,
    /// Correlation id, echoed unchanged in the response.
    pub msg_id: u64,
}

impl Envelope {
    /// Create an envelope from raw field values.
    pub fn new(total_length: u32, header_length: u32, msg_id: u64) -> Self {
        Self {
            total_length,
            header_length,
            msg_id,
        }
    }

    /// Create the envelope for a frame with the given segment sizes.
    ///
    /// Fails if the frame would not fit the 32-bit length field.
    pub fn for_segments(msg_id: u64, header_len: usize, body_len: usize) -> Result<Self> {
        let total = ENVELOPE_TAIL_SIZE as usize + header_len + body_len;
        if total > ABSOLUTE_MAX_FRAME_SIZE as usize {
            return Err(HighwayError::Encode(format!(
                "Frame size {} exceeds maximum {}",
                total, ABSOLUTE_MAX_FRAME_SIZE
            )));
        }
        Ok(Self {
            total_length: total as u32,
            header_length: header_len as u32,
            msg_id,
        })
    }

    /// Encode envelope to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use highway_transport::protocol::Envelope;
    ///
    /// let envelope = Envelope::for_segments(7, 3, 5).unwrap();
    /// let bytes = envelope.encode();
    /// assert_eq!(bytes.len(), 16);
    /// assert_eq!(&bytes[0..4], &16u32.to_be_bytes());
    /// ```
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        let mut buf = [0u8; ENVELOPE_SIZE];
        buf[0..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.header_length.to_be_bytes());
        buf[8..16].copy_from_slice(&self.msg_id.to_be_bytes());
        buf
    }

    /// Decode envelope from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. Does not validate lengths.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ENVELOPE_SIZE {
            return None;
        }
        let mut msg_id = [0u8; 8];
        msg_id.copy_from_slice(&buf[8..16]);
        Some(Self {
            total_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            header_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            msg_id: u64::from_be_bytes(msg_id),
        })
    }

    /// Validate the length fields.
    ///
    /// Any failure here means the byte stream can no longer be delimited,
    /// so it is reported as a connection-level `Protocol` error.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.total_length > ABSOLUTE_MAX_FRAME_SIZE {
            return Err(HighwayError::Protocol(format!(
                "Negative frame length {}",
                self.total_length as i32
            )));
        }

        if self.total_length > max_frame_size {
            return Err(HighwayError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                self.total_length, max_frame_size
            )));
        }

        if self.total_length < ENVELOPE_TAIL_SIZE {
            return Err(HighwayError::Protocol(format!(
                "Frame size {} is smaller than the envelope",
                self.total_length
            )));
        }

        if self.header_length > self.total_length - ENVELOPE_TAIL_SIZE {
            return Err(HighwayError::Protocol(format!(
                "Header length {} exceeds frame size {}",
                self.header_length, self.total_length
            )));
        }

        Ok(())
    }

    /// Bytes still to read after the envelope (header + body).
    #[inline]
    pub fn segments_length(&self) -> usize {
        (self.total_length - ENVELOPE_TAIL_SIZE) as usize
    }

    /// Length of the body segment.
    #[inline]
    pub fn body_length(&self) -> usize {
        self.segments_length() - self.header_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_big_endian_byte_order() {
        let envelope = Envelope::new(0x01020304, 0x05060708, 0x090A0B0C0D0E0F10);
        let bytes = envelope.encode();

        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(
            &bytes[8..16],
            &[0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10]
        );
        assert_eq!(Envelope::decode(&bytes), Some(envelope));
    }

    #[test]
    fn test_for_segments_lengths() {
        let envelope = Envelope::for_segments(42, 10, 25).unwrap();
        assert_eq!(envelope.total_length, 8 + 10 + 25);
        assert_eq!(envelope.header_length, 10);
        assert_eq!(envelope.segments_length(), 35);
        assert_eq!(envelope.body_length(), 25);
    }

    #[test]
    fn test_void_body_has_zero_length() {
        let envelope = Envelope::for_segments(1, 8, 0).unwrap();
        assert_eq!(envelope.body_length(), 0);
        assert!(envelope.validate(DEFAULT_MAX_FRAME_SIZE).is_ok());
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Envelope::decode(&[0u8; ENVELOPE_SIZE - 1]).is_none());
    }

    #[test]
    fn test_validate_negative_length() {
        let envelope = Envelope::new(0x8000_0000, 0, 1);
        let err = envelope.validate(u32::MAX).unwrap_err();
        assert!(err.to_string().contains("Negative frame length"));
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_validate_exceeds_maximum() {
        let envelope = Envelope::new(1000, 0, 1);
        let err = envelope.validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_shorter_than_tail() {
        let envelope = Envelope::new(4, 0, 1);
        assert!(envelope.validate(DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn test_validate_header_longer_than_frame() {
        let envelope = Envelope::new(16, 9, 1);
        let err = envelope.validate(DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(err.to_string().contains("Header length 9"));
    }
}
