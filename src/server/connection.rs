//! Provider side of one accepted connection.
//!
//! The first frame must be a login. A malformed login closes the socket
//! without an answer; a login for another protocol is answered with 400 and
//! then closed. Once logged in, every frame is a request and goes through
//! the [`Scheduler`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use super::scheduler::{ResponseSink, Scheduler};
use crate::codec::{HighwayCodec, StructEncoding};
use crate::config::ServerConfig;
use crate::error::{HighwayError, Result};
use crate::protocol::{LoginResponse, MessageType, ResponseHeader, Role, PROTOCOL_NAME};
use crate::transport::FrameReader;
use crate::writer::spawn_writer_task;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Owns the connection's writer task and aborts it on drop, so the socket
/// closes with the connection even while workers still hold writer handles.
struct WriterTask(Option<JoinHandle<Result<()>>>);

impl WriterTask {
    /// Wait for the writer to drain. Every handle must already be dropped.
    async fn flush(mut self) {
        if let Some(task) = self.0.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WriterTask {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

/// Serve one connection until the peer disconnects or breaks protocol.
pub(crate) async fn serve<S>(
    stream: S,
    peer: &str,
    config: &ServerConfig,
    scheduler: &Arc<Scheduler>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, writer_task) = spawn_writer_task(write_half, &config.writer);
    let writer_task = WriterTask(Some(writer_task));
    let mut reader = FrameReader::new(read_half, config.max_frame_size);

    tracing::debug!(conn = conn_id, peer, "Connection accepted");

    let login = match tokio::time::timeout(config.login_timeout(), reader.next_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            tracing::debug!(conn = conn_id, peer, "Peer left before logging in");
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(HighwayError::Login(format!(
                "{} did not log in within {}ms",
                peer, config.login_timeout_ms
            )))
        }
    };

    tracing::trace!(
        conn = conn_id,
        kind = ?MessageType::inbound(Role::Server, false),
        msg_id = login.msg_id,
        "Frame received"
    );

    let request = HighwayCodec::decode_login(&login).map_err(|e| {
        tracing::warn!(conn = conn_id, peer, error = %e, "Malformed login");
        e
    })?;

    if request.protocol != PROTOCOL_NAME {
        let answer = LoginResponse {
            protocol: PROTOCOL_NAME.to_string(),
            use_named_struct: false,
        };
        let header =
            ResponseHeader::new(400, format!("Unsupported protocol '{}'", request.protocol));
        writer
            .send(HighwayCodec::encode_login_response(login.msg_id, &header, &answer)?)
            .await?;
        drop(writer);
        let _ = tokio::time::timeout(config.login_timeout(), writer_task.flush()).await;
        return Err(HighwayError::Login(format!(
            "{} asked for protocol '{}'",
            peer, request.protocol
        )));
    }

    let encoding =
        StructEncoding::from_named_flag(request.use_named_struct && config.accept_named_struct);
    let answer = LoginResponse {
        protocol: PROTOCOL_NAME.to_string(),
        use_named_struct: encoding.is_named(),
    };
    writer
        .send(HighwayCodec::encode_login_response(
            login.msg_id,
            &ResponseHeader::ok(),
            &answer,
        )?)
        .await?;

    tracing::info!(
        conn = conn_id,
        peer,
        encoding = ?encoding,
        zip = request.zip_name.as_deref().unwrap_or("-"),
        "Connection ready"
    );

    let sink = ResponseSink {
        conn_id,
        writer,
        encoding,
    };

    loop {
        let frame = tokio::select! {
            next = reader.next_frame() => match next? {
                Some(frame) => frame,
                None => break,
            },
            _ = sink.writer.closed() => {
                return Err(HighwayError::TransportFailure("Connection writer closed".into()));
            }
        };

        tracing::trace!(
            conn = conn_id,
            kind = ?MessageType::inbound(Role::Server, true),
            msg_id = frame.msg_id,
            "Frame received"
        );
        scheduler.dispatch(frame, &sink).await?;
    }

    tracing::debug!(conn = conn_id, peer, "Peer closed the connection");
    Ok(())
}
