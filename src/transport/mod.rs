//! Transport module - TCP sockets, the optional TLS upgrade and the frame
//! reader shared by both sides of a connection.

mod reader;
mod tcp;

pub use reader::FrameReader;
pub use tcp::{accept_stream, bind, connect, BoxedStream, Endpoint, IoStream, TlsUpgrade};
