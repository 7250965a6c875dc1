//! MsgPack codec using `rmp-serde`.
//!
//! Two struct encodings exist on the wire and are negotiated per connection
//! during login:
//!
//! - [`StructEncoding::Named`] - `to_vec_named`, structs as maps with field names
//! - [`StructEncoding::Compact`] - `to_vec`, structs as positional arrays
//!
//! Decoding accepts both forms, so only the writer needs to know which one
//! the peer supports.
//!
//! # Example
//!
//! ```
//! use highway_transport::codec::{MsgPackCodec, StructEncoding};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec::encode(&msg, StructEncoding::Named).unwrap();
//! let decoded: Message = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How structs are laid out in MsgPack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StructEncoding {
    /// Maps keyed by field name.
    #[default]
    Named,
    /// Arrays in declaration order.
    Compact,
}

impl StructEncoding {
    /// Encoding for a connection given the login flag.
    pub fn from_named_flag(use_named_struct: bool) -> Self {
        if use_named_struct {
            StructEncoding::Named
        } else {
            StructEncoding::Compact
        }
    }

    /// Check if this is the named (map) encoding.
    #[inline]
    pub fn is_named(&self) -> bool {
        matches!(self, StructEncoding::Named)
    }
}

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes with the given struct encoding.
    ///
    /// # Errors
    ///
    /// Returns an `Encode` error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T, encoding: StructEncoding) -> Result<Vec<u8>> {
        let bytes = match encoding {
            StructEncoding::Named => rmp_serde::to_vec_named(value)?,
            StructEncoding::Compact => rmp_serde::to_vec(value)?,
        };
        Ok(bytes)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns a `Decode` error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
