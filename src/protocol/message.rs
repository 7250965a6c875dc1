//! Header records carried in the header segment of a frame.
//!
//! - [`RequestHeader`] - login and request frames sent by the client
//! - [`ResponseHeader`] - login response and response frames sent by the server
//! - [`LoginRequest`] / [`LoginResponse`] - handshake bodies

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol name declared during login.
pub const PROTOCOL_NAME: &str = "highway";

/// Response header key marking transport-originated failures.
pub const ERROR_KIND_HEADER: &str = "x-highway-error";

/// Response header key carrying how long a discarded request sat in the queue.
pub const QUEUE_WAITED_HEADER: &str = "x-highway-queue-waited-ms";

/// Transport-originated failure kinds, carried in [`ERROR_KIND_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Header or arguments could not be decoded, or the operation is unknown.
    Decode,
    /// Admission control refused the request.
    AdmissionRejected,
    /// The request waited in the queue past its queue timeout.
    QueueTimeout,
    /// The invoker failed without producing an outcome.
    Internal,
}

impl ErrorKind {
    /// Header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "decode",
            ErrorKind::AdmissionRejected => "admission-rejected",
            ErrorKind::QueueTimeout => "queue-timeout",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse a header value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decode" => Some(ErrorKind::Decode),
            "admission-rejected" => Some(ErrorKind::AdmissionRejected),
            "queue-timeout" => Some(ErrorKind::QueueTimeout),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }

    /// Status code used for responses of this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Decode => 400,
            ErrorKind::AdmissionRejected => 429,
            ErrorKind::QueueTimeout => 408,
            ErrorKind::Internal => 590,
        }
    }

    /// Reason phrase used for responses of this kind.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            ErrorKind::Decode => "Bad Request",
            ErrorKind::AdmissionRejected => "Too Many Requests",
            ErrorKind::QueueTimeout => "Request Timeout",
            ErrorKind::Internal => "Internal Server Error",
        }
    }
}

/// Discriminator carried in every [`RequestHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MsgType {
    /// Handshake frame, only valid before the connection is ready.
    Login = 1,
    /// RPC request, only valid once the connection is ready.
    Request = 2,
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgType::Login),
            2 => Ok(MsgType::Request),
            other => Err(format!("Unknown msgType {}", other)),
        }
    }
}

/// Which side of a connection is reading a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consumer side; reads responses.
    Client,
    /// Provider side; reads requests.
    Server,
}

/// Logical frame type.
///
/// Not a wire field: it follows from the connection phase and the role of
/// the reading side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client → server handshake.
    Login,
    /// Server → client handshake answer.
    LoginResponse,
    /// Client → server call.
    Request,
    /// Server → client answer.
    Response,
}

impl MessageType {
    /// Classify a frame read by `role` while the connection is (or is not) ready.
    pub fn inbound(role: Role, ready: bool) -> Self {
        match (role, ready) {
            (Role::Server, false) => MessageType::Login,
            (Role::Server, true) => MessageType::Request,
            (Role::Client, false) => MessageType::LoginResponse,
            (Role::Client, true) => MessageType::Response,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Login => "LOGIN",
            MessageType::LoginResponse => "LOGIN_RESPONSE",
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
        };
        f.write_str(name)
    }
}

/// Header of a login or request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Login or request.
    pub msg_type: MsgType,
    /// Reserved, always 0.
    #[serde(default)]
    pub flags: u32,
    /// Target microservice name.
    #[serde(default)]
    pub dest_microservice: String,
    /// Schema the operation belongs to.
    #[serde(default)]
    pub schema_id: String,
    /// Operation name within the schema.
    #[serde(default)]
    pub operation_name: String,
    /// Call-scoped metadata propagated to the provider.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl RequestHeader {
    /// Header for a request frame.
    pub fn request(
        dest_microservice: impl Into<String>,
        schema_id: impl Into<String>,
        operation_name: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: MsgType::Request,
            flags: 0,
            dest_microservice: dest_microservice.into(),
            schema_id: schema_id.into(),
            operation_name: operation_name.into(),
            context: HashMap::new(),
        }
    }

    /// Header for a login frame.
    pub fn login() -> Self {
        Self {
            msg_type: MsgType::Login,
            flags: 0,
            dest_microservice: String::new(),
            schema_id: String::new(),
            operation_name: String::new(),
            context: HashMap::new(),
        }
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// `service.schema.operation`, used for logging and timeout lookup.
    pub fn qualified_name(&self) -> String {
        format!(
            "{}.{}.{}",
            self.dest_microservice, self.schema_id, self.operation_name
        )
    }
}

/// Header of a login response or response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// HTTP-like status code.
    pub status_code: u16,
    /// Human readable reason.
    #[serde(default)]
    pub reason_phrase: String,
    /// Call-scoped metadata returned to the consumer.
    #[serde(default)]
    pub context: HashMap<String, String>,
    /// Protocol-level response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResponseHeader {
    /// Create a header with a status and reason and no maps.
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
            context: HashMap::new(),
            headers: HashMap::new(),
        }
    }

    /// 200 OK.
    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// Check if the status is 2xx.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Header for a transport-originated failure.
    pub fn transport_error(kind: ErrorKind) -> Self {
        let mut header = Self::new(kind.status_code(), kind.reason_phrase());
        header
            .headers
            .insert(ERROR_KIND_HEADER.to_string(), kind.as_str().to_string());
        header
    }

    /// Transport error marker, if this response reports one.
    pub fn error_kind(&self) -> Option<&str> {
        self.headers.get(ERROR_KIND_HEADER).map(|s| s.as_str())
    }

    /// Parsed transport error marker. Unknown markers read as `Internal`.
    pub fn transport_error_kind(&self) -> Option<ErrorKind> {
        self.error_kind()
            .map(|kind| ErrorKind::parse(kind).unwrap_or(ErrorKind::Internal))
    }
}

/// Login frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Protocol name, must be [`PROTOCOL_NAME`].
    pub protocol: String,
    /// Compression requested by the client. Carried, never applied.
    #[serde(default)]
    pub zip_name: Option<String>,
    /// Whether the client can use named (map) struct encoding.
    #[serde(default)]
    pub use_named_struct: bool,
}

/// Login response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Protocol accepted by the server.
    pub protocol: String,
    /// Whether named struct encoding is in effect for this connection.
    #[serde(default)]
    pub use_named_struct: bool,
}
