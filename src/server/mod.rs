//! Provider side: listener, login, and the request pipeline.
//!
//! # Example
//!
//! ```ignore
//! use highway_transport::codec::OperationSchema;
//! use highway_transport::server::{HighwayServer, InvokeOutcome};
//!
//! let server = HighwayServer::builder()
//!     .listen_address("127.0.0.1:7070")
//!     .operation(
//!         OperationSchema::new("hello", "echo").param("message"),
//!         |_header, mut args| async move { InvokeOutcome::ok(args.remove(0)) },
//!     )
//!     .build()?;
//!
//! let handle = server.bind().await?;
//! // ...
//! handle.shutdown().await;
//! ```

mod connection;
mod dispatch;
mod invoker;
mod scheduler;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::admission::{AdmissionControl, AllowAll};
use crate::codec::{OperationSchema, SchemaRegistry};
use crate::config::{ServerConfig, TimeoutTable};
use crate::error::Result;
use crate::protocol::RequestHeader;
use crate::transport::{self, Endpoint, TlsUpgrade};

pub use dispatch::{FnHandler, OperationDispatcher, OperationHandler, NOT_IMPLEMENTED};
pub use invoker::{BoundedExecutor, Executor, InvokeOutcome, Invoker};
pub use scheduler::InvocationStage;

use scheduler::Scheduler;

/// Builder for [`HighwayServer`].
pub struct HighwayServerBuilder {
    config: ServerConfig,
    schemas: Arc<SchemaRegistry>,
    operations: Vec<OperationSchema>,
    dispatcher: OperationDispatcher,
    invoker: Option<Arc<dyn Invoker>>,
    admission: Arc<dyn AdmissionControl>,
    executor: Option<Arc<dyn Executor>>,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

impl HighwayServerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            schemas: Arc::new(SchemaRegistry::new()),
            operations: Vec::new(),
            dispatcher: OperationDispatcher::new(),
            invoker: None,
            admission: Arc::new(AllowAll),
            executor: None,
            tls: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listen address.
    ///
    /// Default: `0.0.0.0:7070`
    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.config.listen_address = address.into();
        self
    }

    /// Set the queue timeout table.
    pub fn queue_timeout(mut self, timeouts: TimeoutTable) -> Self {
        self.config.queue_timeout = timeouts;
        self
    }

    /// Set the worker pool size.
    ///
    /// Default: 256
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Set how many requests may wait for a busy worker pool.
    ///
    /// Default: 10000
    pub fn max_queued_requests(mut self, count: usize) -> Self {
        self.config.max_queued_requests = count;
        self
    }

    /// Use a shared schema registry. Schemas added by
    /// [`operation`](Self::operation), before or after this call, are
    /// registered into it by [`build`](Self::build).
    pub fn schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Register an operation and its handler.
    pub fn operation<F, Fut>(mut self, schema: OperationSchema, handler: F) -> Self
    where
        F: Fn(RequestHeader, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeOutcome> + Send + 'static,
    {
        self.dispatcher
            .register(schema.schema_id(), schema.operation_name(), handler);
        self.operations.push(schema);
        self
    }

    /// Route every request to `invoker` instead of the registered handlers.
    pub fn invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Set the admission check. Default admits everything.
    pub fn admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = admission;
        self
    }

    /// Set the executor. Default is a [`BoundedExecutor`] sized by
    /// `worker_threads`.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Upgrade accepted sockets with `tls`.
    pub fn tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Validate the configuration and build the server.
    pub fn build(self) -> Result<HighwayServer> {
        self.config.validate()?;

        for schema in self.operations {
            self.schemas.register(schema);
        }

        let invoker = match self.invoker {
            Some(invoker) => invoker,
            None => Arc::new(self.dispatcher),
        };
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(BoundedExecutor::new(
                self.config.worker_threads,
                self.config.max_queued_requests,
            )),
        };
        let scheduler = Arc::new(Scheduler::new(
            self.schemas.clone(),
            invoker,
            self.admission,
            executor,
            self.config.queue_timeout.clone(),
        ));

        Ok(HighwayServer {
            shared: Arc::new(Shared {
                config: self.config,
                schemas: self.schemas,
                scheduler,
                tls: self.tls,
            }),
        })
    }
}

impl Default for HighwayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Shared {
    config: ServerConfig,
    schemas: Arc<SchemaRegistry>,
    scheduler: Arc<Scheduler>,
    tls: Option<Arc<dyn TlsUpgrade>>,
}

/// Highway provider.
#[derive(Clone)]
pub struct HighwayServer {
    shared: Arc<Shared>,
}

impl HighwayServer {
    /// Create a new server builder.
    pub fn builder() -> HighwayServerBuilder {
        HighwayServerBuilder::new()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Schemas this server can decode.
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.shared.schemas
    }

    /// Serve one already-established stream until it closes.
    ///
    /// `bind` calls this for every accepted socket; it is public so tests
    /// and custom listeners can drive in-memory streams.
    pub async fn serve_connection<S>(&self, stream: S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        connection::serve(stream, peer, &self.shared.config, &self.shared.scheduler).await
    }

    /// Bind the listen address and start accepting connections.
    pub async fn bind(&self) -> Result<ServerHandle> {
        let listener = transport::bind(&self.shared.config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(address = %local_addr, "Highway server listening");

        let accept_task = tokio::spawn(accept_loop(self.clone(), listener, shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }
}

async fn accept_loop(
    server: HighwayServer,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    let server = server.clone();
                    connections.spawn(async move {
                        let peer = addr.to_string();
                        let tls = server.shared.tls.as_ref();
                        let served = match transport::accept_stream(socket, tls).await {
                            Ok(stream) => server.serve_connection(stream, &peer).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = served {
                            tracing::warn!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    tracing::info!(open = connections.len(), "Highway server stopping");
    connections.shutdown().await;
}

/// Running listener.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint for clients of this listener.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_socket_addr(self.local_addr)
    }

    /// Stop accepting and close every open connection.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.accept_task.await {
            tracing::error!(error = %e, "Accept loop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{HighwayCodec, StructEncoding};
    use crate::error::HighwayError;
    use crate::protocol::{build_frame, Frame, LoginRequest, ENVELOPE_SIZE, PROTOCOL_NAME};
    use crate::transport::FrameReader;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    fn server() -> HighwayServer {
        HighwayServer::builder()
            .config(ServerConfig {
                login_timeout_ms: 200,
                ..ServerConfig::default()
            })
            .operation(
                OperationSchema::new("hello", "echo").param("message"),
                |_header, mut args| async move { InvokeOutcome::ok(args.remove(0)) },
            )
            .build()
            .unwrap()
    }

    struct Peer {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, frame: Frame) {
            let bytes = build_frame(frame.msg_id, &frame.header, &frame.body).unwrap();
            self.writer.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Frame> {
            self.reader.next_frame().await.unwrap()
        }
    }

    fn connect(server: &HighwayServer) -> (Peer, JoinHandle<Result<()>>) {
        let (client, stream) = duplex(64 * 1024);
        let server = server.clone();
        let task = tokio::spawn(async move { server.serve_connection(stream, "test").await });
        let (read, write) = tokio::io::split(client);
        (
            Peer {
                reader: FrameReader::new(read, 1024 * 1024),
                writer: write,
            },
            task,
        )
    }

    fn login(protocol: &str, named: bool) -> Frame {
        HighwayCodec::encode_login(
            0,
            &LoginRequest {
                protocol: protocol.into(),
                zip_name: None,
                use_named_struct: named,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_then_request() {
        let server = server();
        let (mut peer, _task) = connect(&server);

        peer.send(login(PROTOCOL_NAME, true)).await;
        let answer = HighwayCodec::decode_login_response(&peer.recv().await.unwrap()).unwrap();
        assert!(answer.use_named_struct);

        let schema = OperationSchema::new("hello", "echo").param("message");
        let request = HighwayCodec::encode_request(
            7,
            &RequestHeader::request("S", "hello", "echo"),
            &schema,
            &[json!("hi")],
            StructEncoding::Named,
        )
        .unwrap();
        peer.send(request).await;

        let response = peer.recv().await.unwrap();
        assert_eq!(response.msg_id, 7);
        let (header, value) = HighwayCodec::decode_response(&response, &schema).unwrap();
        assert_eq!(header.status_code, 200);
        assert_eq!(value, json!("hi"));
    }

    #[tokio::test]
    async fn test_named_struct_can_be_refused() {
        let server = HighwayServer::builder()
            .config(ServerConfig {
                accept_named_struct: false,
                ..ServerConfig::default()
            })
            .build()
            .unwrap();
        let (mut peer, _task) = connect(&server);

        peer.send(login(PROTOCOL_NAME, true)).await;
        let answer = HighwayCodec::decode_login_response(&peer.recv().await.unwrap()).unwrap();
        assert!(!answer.use_named_struct);
    }

    #[tokio::test]
    async fn test_wrong_protocol_is_answered_then_closed() {
        let server = server();
        let (mut peer, task) = connect(&server);

        peer.send(login("other", true)).await;
        let answer = peer.recv().await.unwrap();
        let header = HighwayCodec::decode_response_header(&answer).unwrap();
        assert_eq!(header.status_code, 400);
        assert!(HighwayCodec::decode_login_response(&answer).is_err());

        assert!(peer.recv().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(HighwayError::Login(_))));
    }

    async fn echo_round_trip(peer: &mut Peer, msg_id: u64) {
        let schema = OperationSchema::new("hello", "echo").param("message");
        let request = HighwayCodec::encode_request(
            msg_id,
            &RequestHeader::request("S", "hello", "echo"),
            &schema,
            &[json!(msg_id)],
            StructEncoding::Named,
        )
        .unwrap();
        peer.send(request).await;

        let response = peer.recv().await.unwrap();
        assert_eq!(response.msg_id, msg_id);
        let (header, value) = HighwayCodec::decode_response(&response, &schema).unwrap();
        assert_eq!(header.status_code, 200);
        assert_eq!(value, json!(msg_id));
    }

    #[tokio::test]
    async fn test_corrupt_envelope_closes_only_that_connection() {
        let server = server();
        let (mut broken, broken_task) = connect(&server);
        let (mut healthy, _healthy_task) = connect(&server);
        for peer in [&mut broken, &mut healthy] {
            peer.send(login(PROTOCOL_NAME, true)).await;
            peer.recv().await.unwrap();
        }
        echo_round_trip(&mut broken, 1).await;

        let mut envelope = [0u8; ENVELOPE_SIZE];
        envelope[0..4].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        envelope[8..16].copy_from_slice(&2u64.to_be_bytes());
        broken.writer.write_all(&envelope).await.unwrap();

        let result = broken_task.await.unwrap();
        assert!(matches!(result, Err(HighwayError::Protocol(_))), "{:?}", result);
        assert!(broken.recv().await.is_none());

        echo_round_trip(&mut healthy, 3).await;
    }

    #[tokio::test]
    async fn test_malformed_login_closes() {
        let server = server();
        let (mut peer, task) = connect(&server);

        peer.send(Frame::new(0, bytes::Bytes::from_static(b"\xc1"), bytes::Bytes::new()))
            .await;

        assert!(peer.recv().await.is_none());
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_login_timeout() {
        let server = server();
        let (_peer, task) = connect(&server);

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(HighwayError::Login(_))));
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let server = HighwayServer::builder()
            .listen_address("127.0.0.1:0")
            .build()
            .unwrap();

        let handle = server.bind().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.endpoint().host(), "127.0.0.1");

        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operations_land_in_a_later_registry() {
        let shared = Arc::new(SchemaRegistry::new());
        shared.register(OperationSchema::new("hello", "ping"));

        let server = HighwayServer::builder()
            .operation(
                OperationSchema::new("hello", "echo").param("message"),
                |_header, mut args| async move { InvokeOutcome::ok(args.remove(0)) },
            )
            .schemas(shared.clone())
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(server.schemas(), &shared));
        assert!(shared.find("hello", "ping").is_some());
        assert!(shared.find("hello", "echo").is_some());

        let (mut peer, _task) = connect(&server);
        peer.send(login(PROTOCOL_NAME, true)).await;
        peer.recv().await.unwrap();
        echo_round_trip(&mut peer, 5).await;
    }

    #[test]
    fn test_builder_validates() {
        assert!(HighwayServer::builder().worker_threads(0).build().is_err());
    }
}
