//! End-to-end tests over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use highway_transport::admission::{AdmissionControl, AdmissionPermit};
use highway_transport::client::{HighwayClient, Invocation};
use highway_transport::codec::{HighwayCodec, OperationSchema, SchemaRegistry, StructEncoding};
use highway_transport::config::{ServerConfig, TimeoutTable};
use highway_transport::protocol::{
    build_frame, Frame, LoginRequest, LoginResponse, RequestHeader, ResponseHeader,
    ENVELOPE_SIZE, PROTOCOL_NAME,
};
use highway_transport::server::{
    BoundedExecutor, Executor, HighwayServer, InvokeOutcome, Invoker, OperationDispatcher,
    ServerHandle,
};
use highway_transport::transport::{Endpoint, FrameReader};
use highway_transport::{BoxFuture, HighwayError};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn echo() -> OperationSchema {
    OperationSchema::new("hello", "echo").param("message")
}

fn sleep_schema() -> OperationSchema {
    OperationSchema::new("hello", "sleep").param("millis")
}

fn operations() -> OperationDispatcher {
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register("hello", "echo", |_header, mut args| async move {
        InvokeOutcome::ok(args.remove(0))
    });
    dispatcher.register("hello", "sleep", |_header, args| async move {
        let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        InvokeOutcome::ok(json!(millis))
    });
    dispatcher.register("hello", "refuse", |_header, _args| async move {
        InvokeOutcome::business_error(490, "Refused", json!({"code": "NOPE"}))
    });
    dispatcher
}

fn registry() -> Arc<SchemaRegistry> {
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register(echo());
    schemas.register(sleep_schema());
    schemas.register(OperationSchema::new("hello", "refuse"));
    schemas
}

/// Counts invocations before delegating to the registered operations.
struct CountingInvoker {
    calls: AtomicUsize,
    inner: OperationDispatcher,
}

impl CountingInvoker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            inner: operations(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Invoker for CountingInvoker {
    fn invoke(&self, header: RequestHeader, args: Vec<Value>) -> BoxFuture<'static, InvokeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(header, args)
    }
}

/// Counts scheduled tasks before handing them to a bounded executor.
struct CountingExecutor {
    scheduled: AtomicUsize,
    inner: BoundedExecutor,
}

impl Executor for CountingExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) -> highway_transport::Result<()> {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(task)
    }
}

async fn start(config: ServerConfig, invoker: Arc<dyn Invoker>) -> ServerHandle {
    HighwayServer::builder()
        .config(config)
        .schemas(registry())
        .invoker(invoker)
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap()
}

async fn start_default() -> ServerHandle {
    let config = ServerConfig {
        listen_address: "127.0.0.1:0".into(),
        ..ServerConfig::default()
    };
    start(config, Arc::new(operations())).await
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// A hand-driven client speaking raw frames.
struct RawPeer {
    reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read, 1024 * 1024),
            writer: write,
        }
    }

    async fn send(&mut self, frame: &Frame) {
        let bytes = build_frame(frame.msg_id, &frame.header, &frame.body).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        self.reader.next_frame().await.unwrap().expect("server closed")
    }

    async fn login(&mut self, named: bool) {
        let login = LoginRequest {
            protocol: PROTOCOL_NAME.into(),
            zip_name: None,
            use_named_struct: named,
        };
        self.send(&HighwayCodec::encode_login(0, &login).unwrap()).await;
        let answer = HighwayCodec::decode_login_response(&self.recv().await).unwrap();
        assert_eq!(answer.protocol, PROTOCOL_NAME);
        assert_eq!(answer.use_named_struct, named);
    }

    async fn request(&mut self, msg_id: u64, schema: &OperationSchema, args: &[Value]) {
        let header = RequestHeader::request("S", schema.schema_id(), schema.operation_name());
        let frame =
            HighwayCodec::encode_request(msg_id, &header, schema, args, StructEncoding::Named)
                .unwrap();
        self.send(&frame).await;
    }
}

#[tokio::test]
async fn test_raw_login_and_echo() {
    init_tracing();
    let handle = start_default().await;
    let mut peer = RawPeer::connect(&handle).await;

    peer.login(true).await;
    peer.request(7, &echo(), &[json!("hi")]).await;

    let response = peer.recv().await;
    assert_eq!(response.msg_id, 7);
    let (header, value) = HighwayCodec::decode_response(&response, &echo()).unwrap();
    assert_eq!(header.status_code, 200);
    assert_eq!(value, json!("hi"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_responses_correlate_out_of_order() {
    let handle = start_default().await;
    let mut peer = RawPeer::connect(&handle).await;
    peer.login(true).await;

    peer.request(1, &sleep_schema(), &[json!(150)]).await;
    peer.request(2, &sleep_schema(), &[json!(0)]).await;

    let first = peer.recv().await;
    let second = peer.recv().await;
    assert_eq!(first.msg_id, 2);
    assert_eq!(second.msg_id, 1);

    let (_, value) = HighwayCodec::decode_response(&second, &sleep_schema()).unwrap();
    assert_eq!(value, json!(150));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_client_round_trip_and_concurrency() {
    init_tracing();
    let handle = start_default().await;
    let endpoint = handle.endpoint();
    let client = Arc::new(HighwayClient::builder().build().unwrap());
    let sleep = Arc::new(sleep_schema());

    let calls: Vec<_> = [120u64, 60, 0]
        .into_iter()
        .map(|millis| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            let sleep = sleep.clone();
            tokio::spawn(async move {
                client
                    .send(&endpoint, Invocation::new("S", sleep, vec![json!(millis)]))
                    .await
                    .map(|response| (millis, response.value))
            })
        })
        .collect();

    for call in calls {
        let (millis, value) = call.await.unwrap().unwrap();
        assert_eq!(value, json!(millis));
    }
    assert_eq!(client.pool().connection_count(&endpoint), 1);

    client.close();
    handle.shutdown().await;
}

#[tokio::test]
async fn test_compact_encoding_and_context() {
    let handle = start_default().await;
    let endpoint = handle.endpoint();
    let client = HighwayClient::builder()
        .struct_encoding(StructEncoding::Compact)
        .build()
        .unwrap();

    let response = client
        .send(
            &endpoint,
            Invocation::new("S", Arc::new(echo()), vec![json!({"a": [1, 2]})])
                .with_context("trace", "t-9"),
        )
        .await
        .unwrap();

    assert_eq!(response.value, json!({"a": [1, 2]}));
    assert_eq!(response.context.get("trace").map(String::as_str), Some("t-9"));

    let connection = client.pool().get(&endpoint).await.unwrap();
    assert_eq!(connection.encoding(), StructEncoding::Compact);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_business_exception() {
    let handle = start_default().await;
    let client = HighwayClient::builder().build().unwrap();

    let err = client
        .send(
            &handle.endpoint(),
            Invocation::new("S", Arc::new(OperationSchema::new("hello", "refuse")), vec![]),
        )
        .await
        .unwrap_err();

    match err {
        HighwayError::Business {
            status,
            reason,
            payload,
        } => {
            assert_eq!(status, 490);
            assert_eq!(reason, "Refused");
            assert_eq!(payload, json!({"code": "NOPE"}));
        }
        other => panic!("unexpected error: {}", other),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_operation_is_decode_error() {
    let handle = start_default().await;
    let client = HighwayClient::builder().build().unwrap();

    let err = client
        .send(
            &handle.endpoint(),
            Invocation::new("S", Arc::new(OperationSchema::new("hello", "nope")), vec![]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HighwayError::Decode(ref m) if m.contains("hello.nope")));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_timeout_is_bounded_and_connection_survives() {
    let handle = start_default().await;
    let endpoint = handle.endpoint();
    let client = HighwayClient::builder().build().unwrap();
    let sleep = Arc::new(sleep_schema());

    let started = Instant::now();
    let err = client
        .send(
            &endpoint,
            Invocation::new("S", sleep.clone(), vec![json!(400)])
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, HighwayError::RequestTimeout { .. }), "{}", err);
    assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(350), "{:?}", elapsed);

    // The late response for the expired call must not resolve this one.
    let response = client
        .send(&endpoint, Invocation::new("S", sleep, vec![json!(500)]))
        .await
        .unwrap();
    assert_eq!(response.value, json!(500));
    assert_eq!(client.pool().connection_count(&endpoint), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_queue_timeout_discards_without_invoking() {
    init_tracing();
    let invoker = CountingInvoker::new();
    let executor = Arc::new(CountingExecutor {
        scheduled: AtomicUsize::new(0),
        inner: BoundedExecutor::new(1, 16),
    });

    let handle = HighwayServer::builder()
        .listen_address("127.0.0.1:0")
        .queue_timeout(TimeoutTable::new(20))
        .schemas(registry())
        .invoker(invoker.clone())
        .executor(executor.clone())
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();

    let client = Arc::new(HighwayClient::builder().build().unwrap());
    let endpoint = handle.endpoint();
    let sleep = Arc::new(sleep_schema());

    let blocker = {
        let client = client.clone();
        let endpoint = endpoint.clone();
        let sleep = sleep.clone();
        tokio::spawn(async move {
            client
                .send(&endpoint, Invocation::new("S", sleep, vec![json!(200)]))
                .await
        })
    };
    wait_until("first call to start", || invoker.calls() == 1).await;

    let err = client
        .send(&endpoint, Invocation::new("S", sleep, vec![json!(0)]))
        .await
        .unwrap_err();
    match err {
        HighwayError::QueueTimeout { waited_ms } => assert!(waited_ms >= 20),
        other => panic!("unexpected error: {}", other),
    }

    assert!(blocker.await.unwrap().is_ok());
    assert_eq!(executor.scheduled.load(Ordering::SeqCst), 2);
    assert_eq!(invoker.calls(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_admission_rejection_never_schedules() {
    struct RejectAll;

    impl AdmissionControl for RejectAll {
        fn admit(&self, header: &RequestHeader) -> highway_transport::Result<AdmissionPermit> {
            Err(HighwayError::AdmissionRejected(format!(
                "{} is not accepting work",
                header.dest_microservice
            )))
        }
    }

    let invoker = CountingInvoker::new();
    let executor = Arc::new(CountingExecutor {
        scheduled: AtomicUsize::new(0),
        inner: BoundedExecutor::new(4, 16),
    });
    let handle = HighwayServer::builder()
        .listen_address("127.0.0.1:0")
        .schemas(registry())
        .invoker(invoker.clone())
        .executor(executor.clone())
        .admission(Arc::new(RejectAll))
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();

    let client = HighwayClient::builder().build().unwrap();
    let err = client
        .send(
            &handle.endpoint(),
            Invocation::new("S", Arc::new(echo()), vec![json!("hi")]),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HighwayError::AdmissionRejected(ref m) if m == "S is not accepting work"
    ));
    assert_eq!(executor.scheduled.load(Ordering::SeqCst), 0);
    assert_eq!(invoker.calls(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_fails_pending_and_evicts() {
    init_tracing();
    let handle = start_default().await;
    let address = handle.local_addr();
    let endpoint = handle.endpoint();
    let client = Arc::new(HighwayClient::builder().build().unwrap());
    let sleep = Arc::new(sleep_schema());

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            let sleep = sleep.clone();
            tokio::spawn(async move {
                client
                    .send(&endpoint, Invocation::new("S", sleep, vec![json!(10_000)]))
                    .await
            })
        })
        .collect();

    let connection = client.pool().get(&endpoint).await.unwrap();
    wait_until("calls to be pending", || connection.pending_count() == 5).await;

    handle.shutdown().await;

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HighwayError::TransportFailure(_)), "{}", err);
    }
    wait_until("closed connection to be evicted", || {
        client.pool().connection_count(&endpoint) == 0
    })
    .await;

    // A fresh server on the same port gets a fresh connection.
    let handle = start(
        ServerConfig {
            listen_address: address.to_string(),
            ..ServerConfig::default()
        },
        Arc::new(operations()),
    )
    .await;
    let response = client
        .send(&endpoint, Invocation::new("S", Arc::new(echo()), vec![json!("again")]))
        .await
        .unwrap();
    assert_eq!(response.value, json!("again"));
    assert_eq!(client.pool().connection_count(&endpoint), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_response_stream_fails_pending_and_evicts() {
    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::from_socket_addr(listener.local_addr().unwrap());

    // Logs the client in, takes three requests, then answers with a
    // length field no frame can have.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = FrameReader::new(read, 1024 * 1024);

        let login = reader.next_frame().await.unwrap().unwrap();
        let answer = LoginResponse {
            protocol: PROTOCOL_NAME.into(),
            use_named_struct: true,
        };
        let frame =
            HighwayCodec::encode_login_response(login.msg_id, &ResponseHeader::ok(), &answer)
                .unwrap();
        let bytes = build_frame(frame.msg_id, &frame.header, &frame.body).unwrap();
        write.write_all(&bytes).await.unwrap();

        for _ in 0..3 {
            reader.next_frame().await.unwrap().unwrap();
        }

        let mut envelope = [0u8; ENVELOPE_SIZE];
        envelope[0..4].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        write.write_all(&envelope).await.unwrap();
        (reader, write)
    });

    let client = Arc::new(HighwayClient::builder().build().unwrap());
    let echo = Arc::new(echo());
    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            let endpoint = endpoint.clone();
            let echo = echo.clone();
            tokio::spawn(async move {
                client
                    .send(&endpoint, Invocation::new("S", echo, vec![json!(i)]))
                    .await
            })
        })
        .collect();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HighwayError::TransportFailure(_)), "{}", err);
    }
    wait_until("corrupted connection to be evicted", || {
        client.pool().connection_count(&endpoint) == 0
    })
    .await;

    let _server = server.await.unwrap();
}

#[tokio::test]
async fn test_pool_grows_to_target() {
    let handle = start_default().await;
    let endpoint = handle.endpoint();
    let client = HighwayClient::builder()
        .connections_per_endpoint(2)
        .build()
        .unwrap();

    for i in 0..4 {
        let response = client
            .send(&endpoint, Invocation::new("S", Arc::new(echo()), vec![json!(i)]))
            .await
            .unwrap();
        assert_eq!(response.value, json!(i));
    }
    assert_eq!(client.pool().connection_count(&endpoint), 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_connect_refused_is_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let client = HighwayClient::builder().build().unwrap();
    let endpoint: Endpoint = format!("highway://{}", address).parse().unwrap();
    let err = client
        .send(&endpoint, Invocation::new("S", Arc::new(echo()), vec![json!(1)]))
        .await
        .unwrap_err();
    assert!(err.is_connection_fatal(), "{}", err);
}
