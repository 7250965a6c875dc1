//! Frame-level codec for login, request and response frames.
//!
//! Encoding writes the header record first and the schema-encoded body
//! second; the envelope's `headerLength` is what lets [`HighwayCodec`] split
//! them again on the way in. Header records are always self-describing
//! MsgPack, so decoding never needs to know the negotiated encoding.

use bytes::Bytes;
use serde_json::Value;

use super::{MsgPackCodec, OperationSchema, StructEncoding};
use crate::error::{HighwayError, Result};
use crate::protocol::{
    Frame, LoginRequest, LoginResponse, MsgType, RequestHeader, ResponseHeader,
};

/// Codec for Highway frames.
pub struct HighwayCodec;

impl HighwayCodec {
    /// Encode a login frame. Login frames always use named encoding.
    pub fn encode_login(msg_id: u64, login: &LoginRequest) -> Result<Frame> {
        let header = MsgPackCodec::encode(&RequestHeader::login(), StructEncoding::Named)?;
        let body = MsgPackCodec::encode(login, StructEncoding::Named)?;
        Ok(Frame::new(msg_id, Bytes::from(header), Bytes::from(body)))
    }

    /// Decode a login frame read by the server.
    ///
    /// A frame that is not a login is a `Protocol` error; a login whose
    /// body cannot be read is a `Login` error.
    pub fn decode_login(frame: &Frame) -> Result<LoginRequest> {
        let header = Self::decode_request_header(frame)
            .map_err(|e| HighwayError::Protocol(format!("Unreadable login header: {}", e)))?;
        if header.msg_type != MsgType::Login {
            return Err(HighwayError::Protocol(format!(
                "Expected login frame before ready, got {:?}",
                header.msg_type
            )));
        }

        MsgPackCodec::decode(frame.body())
            .map_err(|e| HighwayError::Login(format!("Malformed login request: {}", e)))
    }

    /// Encode the server's answer to a login.
    pub fn encode_login_response(
        msg_id: u64,
        header: &ResponseHeader,
        login: &LoginResponse,
    ) -> Result<Frame> {
        let header = MsgPackCodec::encode(header, StructEncoding::Named)?;
        let body = MsgPackCodec::encode(login, StructEncoding::Named)?;
        Ok(Frame::new(msg_id, Bytes::from(header), Bytes::from(body)))
    }

    /// Decode a login response read by the client.
    ///
    /// Every failure here is a `Login` error: the connection never became
    /// ready.
    pub fn decode_login_response(frame: &Frame) -> Result<LoginResponse> {
        let header: ResponseHeader = MsgPackCodec::decode(frame.header())
            .map_err(|e| HighwayError::Login(format!("Malformed login response header: {}", e)))?;
        if !header.is_success() {
            return Err(HighwayError::Login(format!(
                "Server rejected login: {} {}",
                header.status_code, header.reason_phrase
            )));
        }

        MsgPackCodec::decode(frame.body())
            .map_err(|e| HighwayError::Login(format!("Malformed login response: {}", e)))
    }

    /// Encode a request frame.
    pub fn encode_request(
        msg_id: u64,
        header: &RequestHeader,
        schema: &OperationSchema,
        args: &[Value],
        encoding: StructEncoding,
    ) -> Result<Frame> {
        let body = schema.encode_args(args, encoding)?;
        let header = MsgPackCodec::encode(header, encoding)?;
        Ok(Frame::new(msg_id, Bytes::from(header), Bytes::from(body)))
    }

    /// Decode only the header of a request frame.
    pub fn decode_request_header(frame: &Frame) -> Result<RequestHeader> {
        MsgPackCodec::decode(frame.header())
    }

    /// Decode a request frame into its header and arguments.
    pub fn decode_request(
        frame: &Frame,
        schema: &OperationSchema,
    ) -> Result<(RequestHeader, Vec<Value>)> {
        let header = Self::decode_request_header(frame)?;
        let args = schema.decode_args(frame.body())?;
        Ok((header, args))
    }

    /// Encode a response frame.
    ///
    /// With a schema the body follows the layout for `header.status_code`.
    /// Without one (the request never resolved to an operation) the value is
    /// written as-is, and `null` produces an empty body.
    pub fn encode_response(
        msg_id: u64,
        header: &ResponseHeader,
        schema: Option<&OperationSchema>,
        value: &Value,
        encoding: StructEncoding,
    ) -> Result<Frame> {
        let body = match schema {
            Some(schema) => schema.encode_result(header.status_code, value, encoding)?,
            None if value.is_null() => Vec::new(),
            None => MsgPackCodec::encode(value, encoding)?,
        };
        let header = MsgPackCodec::encode(header, encoding)?;
        Ok(Frame::new(msg_id, Bytes::from(header), Bytes::from(body)))
    }

    /// Decode only the header of a response frame.
    pub fn decode_response_header(frame: &Frame) -> Result<ResponseHeader> {
        MsgPackCodec::decode(frame.header())
    }

    /// Decode a response body given its already-decoded header.
    ///
    /// Transport-originated errors (marked with `x-highway-error`) carry a
    /// plain value regardless of the operation's error layout.
    pub fn decode_response_body(
        frame: &Frame,
        header: &ResponseHeader,
        schema: &OperationSchema,
    ) -> Result<Value> {
        if header.error_kind().is_some() {
            if frame.is_void() {
                return Ok(Value::Null);
            }
            return MsgPackCodec::decode(frame.body());
        }
        schema.decode_result(header.status_code, frame.body())
    }

    /// Decode a response frame into its header and body value.
    pub fn decode_response(
        frame: &Frame,
        schema: &OperationSchema,
    ) -> Result<(ResponseHeader, Value)> {
        let header = Self::decode_response_header(frame)?;
        let value = Self::decode_response_body(frame, &header, schema)?;
        Ok((header, value))
    }
}
