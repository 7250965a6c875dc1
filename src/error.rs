//! Error types for the Highway transport.

use thiserror::Error;

/// Main error type for all Highway operations.
#[derive(Debug, Error)]
pub enum HighwayError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header or body bytes for a single frame.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Arguments or result did not match the operation schema.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Stream-level protocol violation (framing corruption, wrong phase).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake malformed, rejected or timed out.
    #[error("Login failed: {0}")]
    Login(String),

    /// The provider refused the request before queueing it.
    #[error("Request rejected by admission control: {0}")]
    AdmissionRejected(String),

    /// The request waited in the provider's queue longer than allowed.
    #[error("Request discarded after waiting {waited_ms}ms in queue")]
    QueueTimeout {
        /// Time spent between hand-off and dequeue.
        waited_ms: u64,
    },

    /// Socket error or disconnect; resolves every call pending on the connection.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Client-local deadline expired before a response arrived.
    #[error("Request timeout after {timeout_ms}ms (msg_id={msg_id})")]
    RequestTimeout {
        /// Correlation id of the expired call.
        msg_id: u64,
        /// Effective timeout of the call.
        timeout_ms: u64,
    },

    /// Application-level failure carried in the response body.
    #[error("Business exception {status}: {reason}")]
    Business {
        /// Status code chosen by the provider.
        status: u16,
        /// Reason phrase from the response header.
        reason: String,
        /// Decoded error payload.
        payload: serde_json::Value,
    },

    /// Pending-request table is full for this connection.
    #[error("Too many pending requests on connection (capacity {0})")]
    TooManyPending(usize),

    /// Writer queue stayed full past its timeout.
    #[error("Backpressure timeout")]
    Backpressure,

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HighwayError {
    /// Whether this error leaves the byte stream unusable.
    ///
    /// Framing corruption, failed logins and socket failures tear the
    /// connection down; everything else is scoped to a single call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            HighwayError::Io(_)
                | HighwayError::Protocol(_)
                | HighwayError::Login(_)
                | HighwayError::TransportFailure(_)
        )
    }

    /// Build a `Decode` error from anything displayable.
    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        HighwayError::Decode(err.to_string())
    }

    /// Build an `Encode` error from anything displayable.
    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        HighwayError::Encode(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HighwayError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        HighwayError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HighwayError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        HighwayError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for HighwayError {
    fn from(err: serde_json::Error) -> Self {
        HighwayError::Config(err.to_string())
    }
}

/// Result type alias using HighwayError.
pub type Result<T> = std::result::Result<T, HighwayError>;
