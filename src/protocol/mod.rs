//! Protocol module - wire envelope, framing, and header records.
//!
//! This module implements the Highway binary framing:
//! - 16-byte envelope encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Request/response/login header records

mod frame;
mod frame_buffer;
mod message;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{
    ErrorKind, LoginRequest, LoginResponse, MessageType, MsgType, RequestHeader, ResponseHeader,
    Role, ERROR_KIND_HEADER, PROTOCOL_NAME, QUEUE_WAITED_HEADER,
};
pub use wire_format::{
    Envelope, ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE, ENVELOPE_SIZE, ENVELOPE_TAIL_SIZE,
};
