//! # highway-transport
//!
//! Multiplexed RPC transport for microservices over persistent TCP
//! connections.
//!
//! Every frame starts with a fixed 16-byte envelope followed by a MessagePack
//! header and an opaque body:
//!
//! ```text
//! ┌──────────────┬───────────────┬────────────┬──────────┬──────────┐
//! │ totalLength  │ headerLength  │ msgId      │ header   │ body     │
//! │ u32 BE       │ u32 BE        │ u64 BE     │ msgpack  │ msgpack  │
//! └──────────────┴───────────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! Many requests share one connection; responses are matched back to their
//! callers by `msgId` in any order.
//!
//! ## Architecture
//!
//! - **Consumer** ([`client`]): connection pool, login, pending-request
//!   table with per-call deadlines.
//! - **Provider** ([`server`]): login, admission control, queueing with a
//!   queue timeout, and execution through a pluggable invoker.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use highway_transport::client::{HighwayClient, Invocation};
//! use highway_transport::codec::OperationSchema;
//! use highway_transport::server::{HighwayServer, InvokeOutcome};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> highway_transport::Result<()> {
//!     let echo = OperationSchema::new("hello", "echo").param("message");
//!
//!     let server = HighwayServer::builder()
//!         .listen_address("127.0.0.1:0")
//!         .operation(echo.clone(), |_header, mut args| async move {
//!             InvokeOutcome::ok(args.remove(0))
//!         })
//!         .build()?;
//!     let handle = server.bind().await?;
//!
//!     let client = HighwayClient::builder().build()?;
//!     let response = client
//!         .send(
//!             &handle.endpoint(),
//!             Invocation::new("demo", Arc::new(echo), vec![json!("hi")]),
//!         )
//!         .await?;
//!     assert_eq!(response.value, json!("hi"));
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod admission;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

pub use client::{HighwayClient, Invocation, Response};
pub use config::{ClientConfig, HighwayConfig, ServerConfig, TimeoutTable};
pub use error::{HighwayError, Result};
pub use server::{HighwayServer, InvokeOutcome, ServerHandle};
pub use transport::Endpoint;

/// Boxed future used at the crate's trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
