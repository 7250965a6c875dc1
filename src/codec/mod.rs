//! Codec module - serialization/deserialization for frame segments.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde`, named or compact structs
//! - [`OperationSchema`] / [`SchemaRegistry`] - per-operation body layouts
//! - [`HighwayCodec`] - login, request and response frames
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! All of them are pure: they turn records and values into [`Frame`]s and back
//! without touching connection state.
//!
//! [`Frame`]: crate::protocol::Frame
//!
//! # Example
//!
//! ```
//! use highway_transport::codec::{HighwayCodec, OperationSchema, StructEncoding};
//! use highway_transport::protocol::RequestHeader;
//! use serde_json::json;
//!
//! let schema = OperationSchema::new("hello", "echo").param("message");
//! let header = RequestHeader::request("S", "hello", "echo");
//!
//! let args = [json!("hi")];
//! let frame =
//!     HighwayCodec::encode_request(7, &header, &schema, &args, StructEncoding::Named).unwrap();
//! let (decoded, args) = HighwayCodec::decode_request(&frame, &schema).unwrap();
//! assert_eq!(decoded, header);
//! assert_eq!(args, vec![json!("hi")]);
//! ```

mod highway;
mod msgpack;
mod schema;

pub use highway::HighwayCodec;
pub use msgpack::{MsgPackCodec, StructEncoding};
pub use schema::{BodyLayout, OperationSchema, SchemaRegistry};
