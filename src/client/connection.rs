//! Client side of one persistent Highway connection.
//!
//! Lifecycle: `Connecting → LoginPending → Ready → Closed`.
//!
//! [`ClientConnection::establish`] runs the login exchange inline and only
//! returns a connection once it is ready. After that three tasks share it:
//!
//! - the writer task (see [`crate::writer`]) owns the write half
//! - the read task feeds the frame buffer and resolves pending calls
//! - the sweeper expires calls whose caller stopped waiting
//!
//! Closing the connection, for any reason, fails every pending call with
//! `TransportFailure` and wakes whoever watches [`ClientConnection::closed`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::pending::PendingTable;
use crate::codec::{HighwayCodec, OperationSchema, StructEncoding};
use crate::config::ClientConfig;
use crate::error::{HighwayError, Result};
use crate::protocol::{Frame, LoginRequest, RequestHeader, PROTOCOL_NAME};
use crate::transport::{Endpoint, FrameReader};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Message id used by the login exchange. Request ids are never 0.
const LOGIN_MSG_ID: u64 = 0;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket open, nothing sent yet.
    Connecting = 0,
    /// Login sent, waiting for the server's answer.
    LoginPending = 1,
    /// Requests may flow.
    Ready = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::LoginPending,
            2 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }
}

/// A logged-in client connection.
pub struct ClientConnection {
    id: u64,
    endpoint: Endpoint,
    state: AtomicU8,
    encoding: StructEncoding,
    writer: WriterHandle,
    pending: PendingTable,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ClientConnection {
    /// Log in over `stream` and start the connection's tasks.
    ///
    /// Fails with a `Login` error if the server does not answer within the
    /// login timeout or answers with something unacceptable.
    pub async fn establish<S>(
        stream: S,
        endpoint: Endpoint,
        config: &ClientConfig,
    ) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, &config.writer);
        let mut reader = FrameReader::new(read_half, config.max_frame_size);

        tracing::debug!(
            conn = id,
            endpoint = %endpoint,
            state = ?ConnectionState::LoginPending,
            "Logging in"
        );

        let login = LoginRequest {
            protocol: PROTOCOL_NAME.to_string(),
            zip_name: None,
            use_named_struct: config.struct_encoding.is_named(),
        };

        let login_timeout = config.login_timeout();
        let exchange = async {
            writer
                .send(HighwayCodec::encode_login(LOGIN_MSG_ID, &login)?)
                .await?;
            reader
                .next_frame()
                .await?
                .ok_or_else(|| HighwayError::Login("Connection closed during login".into()))
        };

        let answer = match tokio::time::timeout(login_timeout, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                writer_task.abort();
                return Err(match e {
                    HighwayError::Login(_) => e,
                    other => HighwayError::Login(other.to_string()),
                });
            }
            Err(_) => {
                writer_task.abort();
                return Err(HighwayError::Login(format!(
                    "No login response from {} within {}ms",
                    endpoint,
                    login_timeout.as_millis()
                )));
            }
        };

        let accepted = match HighwayCodec::decode_login_response(&answer) {
            Ok(accepted) if accepted.protocol == PROTOCOL_NAME => accepted,
            Ok(accepted) => {
                writer_task.abort();
                return Err(HighwayError::Login(format!(
                    "Server answered with protocol '{}'",
                    accepted.protocol
                )));
            }
            Err(e) => {
                writer_task.abort();
                return Err(e);
            }
        };

        let encoding =
            StructEncoding::from_named_flag(login.use_named_struct && accepted.use_named_struct);

        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id,
            endpoint,
            state: AtomicU8::new(ConnectionState::Ready as u8),
            encoding,
            writer,
            pending: PendingTable::new(config.max_pending_per_connection),
            closed_tx,
            tasks: Mutex::new(Vec::with_capacity(2)),
            writer_task: Mutex::new(Some(writer_task)),
        });

        tracing::info!(
            conn = id,
            endpoint = %connection.endpoint,
            encoding = ?encoding,
            "Connection ready"
        );

        let read_task = tokio::spawn(read_loop(connection.clone(), reader));
        let sweep_task = tokio::spawn(sweep_loop(
            Arc::downgrade(&connection),
            config.timeout_check_interval(),
        ));
        connection.tasks.lock().extend([read_task, sweep_task]);

        Ok(connection)
    }

    /// Send a request and wait for its response frame.
    ///
    /// Always completes by `deadline`: with the response, a `RequestTimeout`,
    /// or a `TransportFailure` if the connection drops first.
    pub async fn call(
        &self,
        header: &RequestHeader,
        schema: &OperationSchema,
        args: &[Value],
        deadline: Instant,
    ) -> Result<Frame> {
        if !self.is_ready() {
            return Err(HighwayError::TransportFailure(format!(
                "Connection to {} is {:?}",
                self.endpoint,
                self.state()
            )));
        }

        // Encode before registering so a schema mismatch never takes a slot.
        let mut frame = HighwayCodec::encode_request(0, header, schema, args, self.encoding)?;

        let timeout_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        let (msg_id, mut rx) = self.pending.register(deadline, timeout_ms)?;
        frame.msg_id = msg_id;

        tracing::debug!(
            conn = self.id,
            msg_id,
            operation = %header.qualified_name(),
            "Sending request"
        );

        // Backpressure may outlast the call; the deadline bounds the hand-off too.
        match tokio::time::timeout_at(deadline, self.writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if self.pending.complete(msg_id, Err(e)) {
                    tracing::debug!(conn = self.id, msg_id, "Request not written");
                }
            }
            Err(_) => {
                tracing::debug!(conn = self.id, msg_id, "Writer still busy at deadline");
            }
        }

        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Loses to a response that arrived in the same instant.
                self.pending.expire(msg_id);
                rx.await
            }
        };

        outcome.unwrap_or_else(|_| {
            Err(HighwayError::TransportFailure(
                "Pending request dropped".into(),
            ))
        })
    }

    /// Close the connection and fail every pending call.
    pub fn close(&self, reason: &str) {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return;
        }

        let failed = self.pending.close(reason);
        tracing::info!(
            conn = self.id,
            endpoint = %self.endpoint,
            failed_calls = failed,
            reason,
            "Connection closed"
        );

        if let Some(task) = self.writer_task.lock().take() {
            task.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.closed_tx.send_replace(true);
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if requests may be sent.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Struct encoding negotiated at login.
    pub fn encoding(&self) -> StructEncoding {
        self.encoding
    }

    /// Endpoint this connection talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Capacity of the pending-request table.
    pub fn pending_capacity(&self) -> usize {
        self.pending.capacity()
    }

    fn on_response(&self, frame: Frame) {
        let msg_id = frame.msg_id();
        if !self.pending.complete(msg_id, Ok(frame)) {
            tracing::warn!(
                conn = self.id,
                endpoint = %self.endpoint,
                msg_id,
                "Dropping response with unknown or already resolved msg_id"
            );
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.writer_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish()
    }
}

async fn read_loop<S>(connection: Arc<ClientConnection>, mut reader: FrameReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let reason = loop {
        let next = tokio::select! {
            next = reader.next_frame() => next,
            _ = connection.writer.closed() => break "Writer stopped".to_string(),
        };

        match next {
            Ok(Some(frame)) => connection.on_response(frame),
            Ok(None) => break "Peer closed the connection".to_string(),
            Err(e) => {
                tracing::error!(conn = connection.id, error = %e, "Connection read failed");
                break e.to_string();
            }
        }
    };

    // `close` aborts this task; detach first so the abort can't cut the fan-out short.
    connection.tasks.lock().clear();
    connection.close(&reason);
}

async fn sweep_loop(connection: std::sync::Weak<ClientConnection>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if !connection.is_ready() {
            return;
        }

        let expired = connection.pending.expire_due(Instant::now());
        if expired > 0 {
            tracing::debug!(conn = connection.id, expired, "Expired abandoned requests");
        }
    }
}
