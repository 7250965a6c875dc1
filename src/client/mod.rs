//! Consumer side: connection pool, request multiplexer and client facade.
//!
//! [`HighwayClient::send`] resolves the call's effective timeout, takes a
//! ready connection from the pool, and waits for the correlated response.
//! Every call completes by its deadline with a [`Response`] or an error
//! from the [`HighwayError`] taxonomy.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use highway_transport::client::{HighwayClient, Invocation};
//! use highway_transport::codec::OperationSchema;
//! use serde_json::json;
//!
//! let client = HighwayClient::builder().build()?;
//! let echo = Arc::new(OperationSchema::new("hello", "echo").param("message"));
//!
//! let endpoint = "highway://127.0.0.1:7070".parse()?;
//! let response = client
//!     .send(&endpoint, Invocation::new("S", echo, vec![json!("hi")]))
//!     .await?;
//! assert_eq!(response.value, json!("hi"));
//! ```

mod connection;
mod pending;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::codec::{HighwayCodec, OperationSchema, StructEncoding};
use crate::config::{ClientConfig, TimeoutTable};
use crate::error::{HighwayError, Result};
use crate::protocol::{ErrorKind, Frame, RequestHeader, QUEUE_WAITED_HEADER};
use crate::transport::{Endpoint, TlsUpgrade};

pub use connection::{ClientConnection, ConnectionState};
pub use pool::ConnectionPool;

/// One outbound call.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Destination microservice.
    pub service: String,
    /// Operation being called.
    pub schema: Arc<OperationSchema>,
    /// Arguments in parameter order.
    pub args: Vec<Value>,
    /// Call-scoped metadata sent to the provider.
    pub context: HashMap<String, String>,
    /// Overrides the configured timeout for this call.
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Create a call with no context and the configured timeout.
    pub fn new(service: impl Into<String>, schema: Arc<OperationSchema>, args: Vec<Value>) -> Self {
        Self {
            service: service.into(),
            schema,
            args,
            context: HashMap::new(),
            timeout: None,
        }
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Set an explicit timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn header(&self) -> RequestHeader {
        let mut header = RequestHeader::request(
            self.service.clone(),
            self.schema.schema_id(),
            self.schema.operation_name(),
        );
        header.context = self.context.clone();
        header
    }
}

/// Successful outcome of a call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// 2xx status from the provider.
    pub status_code: u16,
    /// Reason phrase from the provider.
    pub reason_phrase: String,
    /// Decoded result, `null` for void operations.
    pub value: Value,
    /// Request context merged with the context returned by the provider.
    pub context: HashMap<String, String>,
    /// Protocol-level response headers.
    pub headers: HashMap<String, String>,
}

/// Builder for [`HighwayClient`].
pub struct HighwayClientBuilder {
    config: ClientConfig,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl HighwayClientBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            tls: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the request timeout table.
    pub fn request_timeout(mut self, timeouts: TimeoutTable) -> Self {
        self.config.request_timeout = timeouts;
        self
    }

    /// Set the number of connections per endpoint.
    ///
    /// Default: 1
    pub fn connections_per_endpoint(mut self, count: usize) -> Self {
        self.config.connections_per_endpoint = count;
        self
    }

    /// Set the pending-request capacity of each connection.
    ///
    /// Default: 4096
    pub fn max_pending_per_connection(mut self, capacity: usize) -> Self {
        self.config.max_pending_per_connection = capacity;
        self
    }

    /// Set the struct encoding offered at login.
    ///
    /// Default: named
    pub fn struct_encoding(mut self, encoding: StructEncoding) -> Self {
        self.config.struct_encoding = encoding;
        self
    }

    /// Use `tls` for endpoints flagged `sslEnabled`.
    pub fn tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<HighwayClient> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        Ok(HighwayClient {
            pool: ConnectionPool::new(config.clone(), self.tls),
            config,
        })
    }
}

impl Default for HighwayClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Highway consumer.
pub struct HighwayClient {
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
}

impl HighwayClient {
    /// Create a new client builder.
    pub fn builder() -> HighwayClientBuilder {
        HighwayClientBuilder::new()
    }

    /// Call an operation on `endpoint`.
    ///
    /// Connection setup counts against the call's timeout.
    pub async fn send(&self, endpoint: &Endpoint, invocation: Invocation) -> Result<Response> {
        let timeout = invocation.timeout.unwrap_or_else(|| {
            self.config.request_timeout.resolve(
                &invocation.service,
                invocation.schema.schema_id(),
                invocation.schema.operation_name(),
            )
        });
        let deadline = Instant::now() + timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let connection = match tokio::time::timeout_at(deadline, self.pool.get(endpoint)).await {
            Ok(connection) => connection?,
            Err(_) => {
                return Err(HighwayError::RequestTimeout {
                    msg_id: 0,
                    timeout_ms,
                })
            }
        };

        let header = invocation.header();
        let frame = connection
            .call(&header, &invocation.schema, &invocation.args, deadline)
            .await?;

        into_response(&frame, &invocation.schema, invocation.context)
    }

    /// The shared connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close every pooled connection.
    pub fn close(&self) {
        self.pool.close_all();
    }
}

/// Decode a response frame and map failures onto the error taxonomy.
fn into_response(
    frame: &Frame,
    schema: &OperationSchema,
    mut context: HashMap<String, String>,
) -> Result<Response> {
    let (header, value) = HighwayCodec::decode_response(frame, schema)?;

    if let Some(kind) = header.transport_error_kind() {
        let message = match &value {
            Value::String(message) => message.clone(),
            Value::Null => header.reason_phrase.clone(),
            other => other.to_string(),
        };
        return Err(match kind {
            ErrorKind::Decode => HighwayError::Decode(message),
            ErrorKind::AdmissionRejected => HighwayError::AdmissionRejected(message),
            ErrorKind::QueueTimeout => HighwayError::QueueTimeout {
                waited_ms: header
                    .headers
                    .get(QUEUE_WAITED_HEADER)
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(0),
            },
            ErrorKind::Internal => HighwayError::Business {
                status: header.status_code,
                reason: header.reason_phrase,
                payload: value,
            },
        });
    }

    if !header.is_success() {
        return Err(HighwayError::Business {
            status: header.status_code,
            reason: header.reason_phrase,
            payload: value,
        });
    }

    context.extend(header.context);
    Ok(Response {
        status_code: header.status_code,
        reason_phrase: header.reason_phrase,
        value,
        context,
        headers: header.headers,
    })
}
