//! Runtime configuration for clients and servers.
//!
//! Everything here is plain data with serde defaults, so a partial JSON
//! document is enough:
//!
//! ```
//! use highway_transport::config::HighwayConfig;
//!
//! let config = HighwayConfig::from_json_str(r#"{
//!     "client": {
//!         "request_timeout": {
//!             "global_ms": 5000,
//!             "overrides": { "orders.OrderSchema.create": 500 }
//!         }
//!     },
//!     "server": { "listen_address": "127.0.0.1:7070" }
//! }"#).unwrap();
//!
//! let timeout = config.client.request_timeout.resolve("orders", "OrderSchema", "create");
//! assert_eq!(timeout.as_millis(), 500);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::StructEncoding;
use crate::error::{HighwayError, Result};
use crate::protocol::{ABSOLUTE_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE, ENVELOPE_TAIL_SIZE};
use crate::writer::WriterConfig;

/// Default request timeout and queue timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default number of connections kept per endpoint.
pub const DEFAULT_CONNECTIONS_PER_ENDPOINT: usize = 1;

/// Default capacity of a connection's pending-request table.
pub const DEFAULT_MAX_PENDING_PER_CONNECTION: usize = 4096;

/// Default period of the pending-request sweeper.
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL_MS: u64 = 100;

/// Default size of the server worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 256;

/// Default bound on requests waiting for a server worker.
pub const DEFAULT_MAX_QUEUED_REQUESTS: usize = 10_000;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:7070";

/// Largest pending table a connection can index with a 32-bit slot.
const MAX_PENDING_CAPACITY: usize = u32::MAX as usize;

/// Timeouts with per-service, per-schema and per-operation overrides.
///
/// Override keys are `service`, `service.schema` or
/// `service.schema.operation`; the most specific one present wins.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeoutTable {
    /// Fallback for calls with no override.
    pub global_ms: u64,
    /// Overrides keyed by qualified name.
    pub overrides: BTreeMap<String, u64>,
}

impl TimeoutTable {
    /// Table with only a global value.
    pub fn new(global_ms: u64) -> Self {
        Self {
            global_ms,
            overrides: BTreeMap::new(),
        }
    }

    /// Add an override.
    pub fn with_override(mut self, key: impl Into<String>, timeout_ms: u64) -> Self {
        self.overrides.insert(key.into(), timeout_ms);
        self
    }

    /// Effective timeout in milliseconds.
    ///
    /// Operation beats schema beats service beats global.
    pub fn resolve_ms(&self, service: &str, schema_id: &str, operation: &str) -> u64 {
        let schema_key = format!("{}.{}", service, schema_id);
        let operation_key = format!("{}.{}", schema_key, operation);

        [operation_key.as_str(), schema_key.as_str(), service]
            .iter()
            .find_map(|key| self.overrides.get(*key).copied())
            .unwrap_or(self.global_ms)
    }

    /// Effective timeout as a `Duration`.
    pub fn resolve(&self, service: &str, schema_id: &str, operation: &str) -> Duration {
        Duration::from_millis(self.resolve_ms(service, schema_id, operation))
    }

    /// The global value as a `Duration`.
    pub fn global(&self) -> Duration {
        Duration::from_millis(self.global_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.global_ms == 0 {
            return Err(HighwayError::Config(format!("{}.global_ms must be > 0", name)));
        }
        if let Some((key, _)) = self.overrides.iter().find(|(_, ms)| **ms == 0) {
            return Err(HighwayError::Config(format!(
                "{}.overrides[{}] must be > 0",
                name, key
            )));
        }
        Ok(())
    }
}

impl Default for TimeoutTable {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_MS)
    }
}

/// Consumer-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call deadline.
    pub request_timeout: TimeoutTable,
    /// Connections opened per endpoint.
    pub connections_per_endpoint: usize,
    /// Login deadline. Defaults to the global request timeout.
    pub login_timeout_ms: Option<u64>,
    /// Capacity of each connection's pending-request table.
    pub max_pending_per_connection: usize,
    /// Period of the sweeper that expires abandoned calls.
    pub timeout_check_interval_ms: u64,
    /// Largest accepted inbound frame.
    pub max_frame_size: u32,
    /// Outbound queue settings.
    pub writer: WriterConfig,
    /// Struct encoding offered during login.
    pub struct_encoding: StructEncoding,
}

impl ClientConfig {
    /// Effective login deadline.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms.unwrap_or(self.request_timeout.global_ms))
    }

    /// Sweeper period.
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        self.request_timeout.validate("client.request_timeout")?;
        if self.connections_per_endpoint == 0 {
            return Err(HighwayError::Config(
                "client.connections_per_endpoint must be > 0".into(),
            ));
        }
        if self.max_pending_per_connection == 0
            || self.max_pending_per_connection > MAX_PENDING_CAPACITY
        {
            return Err(HighwayError::Config(format!(
                "client.max_pending_per_connection must be in 1..={}",
                MAX_PENDING_CAPACITY
            )));
        }
        if self.timeout_check_interval_ms == 0 {
            return Err(HighwayError::Config(
                "client.timeout_check_interval_ms must be > 0".into(),
            ));
        }
        if self.login_timeout_ms == Some(0) {
            return Err(HighwayError::Config("client.login_timeout_ms must be > 0".into()));
        }
        validate_frame_size("client", self.max_frame_size)?;
        validate_writer("client", &self.writer)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: TimeoutTable::default(),
            connections_per_endpoint: DEFAULT_CONNECTIONS_PER_ENDPOINT,
            login_timeout_ms: None,
            max_pending_per_connection: DEFAULT_MAX_PENDING_PER_CONNECTION,
            timeout_check_interval_ms: DEFAULT_TIMEOUT_CHECK_INTERVAL_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            writer: WriterConfig::default(),
            struct_encoding: StructEncoding::Named,
        }
    }
}

/// Provider-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub listen_address: String,
    /// Longest a request may wait between hand-off and execution.
    pub queue_timeout: TimeoutTable,
    /// Size of the bounded worker pool.
    pub worker_threads: usize,
    /// Requests allowed to wait for a busy worker pool. Beyond this the
    /// executor turns work away with `admission-rejected`.
    pub max_queued_requests: usize,
    /// How long a new connection may take to log in.
    pub login_timeout_ms: u64,
    /// Largest accepted inbound frame.
    pub max_frame_size: u32,
    /// Outbound queue settings.
    pub writer: WriterConfig,
    /// Whether clients may negotiate named struct encoding.
    pub accept_named_struct: bool,
}

impl ServerConfig {
    /// Login deadline.
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        self.queue_timeout.validate("server.queue_timeout")?;
        if self.listen_address.is_empty() {
            return Err(HighwayError::Config("server.listen_address is empty".into()));
        }
        if self.worker_threads == 0 {
            return Err(HighwayError::Config("server.worker_threads must be > 0".into()));
        }
        if self.login_timeout_ms == 0 {
            return Err(HighwayError::Config("server.login_timeout_ms must be > 0".into()));
        }
        validate_frame_size("server", self.max_frame_size)?;
        validate_writer("server", &self.writer)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            queue_timeout: TimeoutTable::default(),
            worker_threads: DEFAULT_WORKER_THREADS,
            max_queued_requests: DEFAULT_MAX_QUEUED_REQUESTS,
            login_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            writer: WriterConfig::default(),
            accept_named_struct: true,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HighwayConfig {
    /// Consumer side.
    pub client: ClientConfig,
    /// Provider side.
    pub server: ServerConfig,
}

impl HighwayConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges on both sides.
    pub fn validate(&self) -> Result<()> {
        self.client.validate()?;
        self.server.validate()
    }
}

fn validate_frame_size(side: &str, max_frame_size: u32) -> Result<()> {
    if !(ENVELOPE_TAIL_SIZE..=ABSOLUTE_MAX_FRAME_SIZE).contains(&max_frame_size) {
        return Err(HighwayError::Config(format!(
            "{}.max_frame_size must be in {}..={}",
            side, ENVELOPE_TAIL_SIZE, ABSOLUTE_MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

fn validate_writer(side: &str, writer: &WriterConfig) -> Result<()> {
    if writer.channel_capacity == 0 || writer.max_pending_frames == 0 {
        return Err(HighwayError::Config(format!(
            "{}.writer capacities must be > 0",
            side
        )));
    }
    Ok(())
}
