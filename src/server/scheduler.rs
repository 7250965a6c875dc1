//! Per-request pipeline on the provider side.
//!
//! Every request frame moves through explicit stages, carried by an
//! [`InvocationContext`] that is passed from stage to stage:
//!
//! ```text
//!  I/O task                       worker
//! ┌──────────────────────┐       ┌─────────────────────────────────────┐
//! │ decode → admit → ────┼─queue─┼→ queue timeout → execute → respond  │
//! └───┬──────────┬───────┘       └──────┬──────────────────────────────┘
//!     │400       │429                   │408
//!     └──────────┴────→ respond ←───────┘
//! ```
//!
//! Decode and admission failures are answered from the I/O task and never
//! reach the executor. An executor with no room left gets the same 429
//! answer as admission control. A request that waited past its queue
//! timeout is answered without calling the invoker. Every request frame
//! gets exactly one response, except a login frame on a ready connection,
//! which is a protocol violation and closes the connection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::invoker::{Executor, InvokeOutcome, Invoker};
use crate::admission::{AdmissionControl, AdmissionPermit};
use crate::codec::{HighwayCodec, OperationSchema, SchemaRegistry, StructEncoding};
use crate::config::TimeoutTable;
use crate::error::{HighwayError, Result};
use crate::protocol::{
    ErrorKind, Frame, MsgType, RequestHeader, ResponseHeader, QUEUE_WAITED_HEADER,
};
use crate::writer::WriterHandle;

/// Where a request is in its life on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStage {
    /// Frame read off the socket, nothing decoded yet.
    Received,
    /// Header and arguments decoded against a known schema.
    FrameDecoded,
    /// Admission control accepted the request.
    Admitted,
    /// Handed to the executor, waiting for a worker.
    Queued,
    /// Invoker running.
    Executing,
    /// Response handed to the writer.
    ResponseSent,
    /// Turned away by admission control.
    Rejected,
    /// Decode failure, queue timeout or internal error.
    Failed,
}

/// What the respond stage will send.
enum Reply {
    Outcome(InvokeOutcome),
    TransportError {
        kind: ErrorKind,
        message: String,
        waited_ms: Option<u64>,
    },
}

/// State of one request, passed explicitly between stages.
pub(crate) struct InvocationContext {
    frame: Frame,
    stage: InvocationStage,
    header: Option<RequestHeader>,
    schema: Option<Arc<OperationSchema>>,
    args: Vec<Value>,
    permit: Option<AdmissionPermit>,
    queued_at: Option<Instant>,
    queue_timeout: Duration,
    reply: Option<Reply>,
}

impl InvocationContext {
    fn new(frame: Frame) -> Self {
        Self {
            frame,
            stage: InvocationStage::Received,
            header: None,
            schema: None,
            args: Vec::new(),
            permit: None,
            queued_at: None,
            queue_timeout: Duration::ZERO,
            reply: None,
        }
    }

    #[inline]
    fn msg_id(&self) -> u64 {
        self.frame.msg_id
    }

    fn enter(&mut self, stage: InvocationStage) {
        tracing::trace!(
            msg_id = self.msg_id(),
            from = ?self.stage,
            to = ?stage,
            "Invocation stage"
        );
        self.stage = stage;
    }

    fn operation(&self) -> String {
        self.header
            .as_ref()
            .map(RequestHeader::qualified_name)
            .unwrap_or_else(|| "<undecoded>".to_string())
    }

    /// Record a transport-originated error and end the pipeline.
    fn fail(&mut self, kind: ErrorKind, message: String) -> Flow {
        self.fail_with(kind, message, None)
    }

    fn expire_in_queue(&mut self, waited_ms: u64) -> Flow {
        let message = format!("Waited {}ms in queue", waited_ms);
        self.fail_with(ErrorKind::QueueTimeout, message, Some(waited_ms))
    }

    fn fail_with(&mut self, kind: ErrorKind, message: String, waited_ms: Option<u64>) -> Flow {
        self.enter(match kind {
            ErrorKind::AdmissionRejected => InvocationStage::Rejected,
            _ => InvocationStage::Failed,
        });
        self.reply = Some(Reply::TransportError {
            kind,
            message,
            waited_ms,
        });
        Flow::Respond
    }
}

/// Outcome of a synchronous stage.
enum Flow {
    Continue,
    Respond,
}

type Stage = fn(&Scheduler, &mut InvocationContext) -> Result<Flow>;

/// Stages run on the connection's I/O task.
const INBOUND_STAGES: &[Stage] = &[Scheduler::decode, Scheduler::admit];

/// Stages run on a worker before the invoker.
const WORKER_STAGES: &[Stage] = &[Scheduler::check_queue_timeout];

/// Writer side of the connection a request arrived on.
#[derive(Clone)]
pub(crate) struct ResponseSink {
    pub(crate) conn_id: u64,
    pub(crate) writer: WriterHandle,
    pub(crate) encoding: StructEncoding,
}

/// Shared request pipeline for every connection of a server.
pub(crate) struct Scheduler {
    schemas: Arc<SchemaRegistry>,
    invoker: Arc<dyn Invoker>,
    admission: Arc<dyn AdmissionControl>,
    executor: Arc<dyn Executor>,
    queue_timeout: TimeoutTable,
}

impl Scheduler {
    pub(crate) fn new(
        schemas: Arc<SchemaRegistry>,
        invoker: Arc<dyn Invoker>,
        admission: Arc<dyn AdmissionControl>,
        executor: Arc<dyn Executor>,
        queue_timeout: TimeoutTable,
    ) -> Self {
        Self {
            schemas,
            invoker,
            admission,
            executor,
            queue_timeout,
        }
    }

    /// Run the inbound stages for `frame` and either answer it directly
    /// or hand it to the executor.
    ///
    /// Returns an error only for protocol violations that must close the
    /// connection.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        sink: &ResponseSink,
    ) -> Result<()> {
        let mut ctx = InvocationContext::new(frame);

        match self.run_stages(INBOUND_STAGES, &mut ctx)? {
            Flow::Respond => self.respond(ctx, sink).await,
            Flow::Continue => self.enqueue(ctx, sink).await,
        }
        Ok(())
    }

    fn run_stages(&self, stages: &[Stage], ctx: &mut InvocationContext) -> Result<Flow> {
        for stage in stages {
            if let Flow::Respond = stage(self, ctx)? {
                return Ok(Flow::Respond);
            }
        }
        Ok(Flow::Continue)
    }

    fn decode(&self, ctx: &mut InvocationContext) -> Result<Flow> {
        let header = match HighwayCodec::decode_request_header(&ctx.frame) {
            Ok(header) => header,
            Err(e) => return Ok(ctx.fail(ErrorKind::Decode, error_message(e))),
        };

        if header.msg_type == MsgType::Login {
            return Err(HighwayError::Protocol(format!(
                "Login frame (msg_id={}) on a ready connection",
                ctx.msg_id()
            )));
        }

        let decoded = self
            .schemas
            .ensure_find(&header.schema_id, &header.operation_name)
            .and_then(|schema| {
                let args = schema.decode_args(ctx.frame.body())?;
                Ok((schema, args))
            });
        ctx.header = Some(header);

        match decoded {
            Ok((schema, args)) => {
                ctx.schema = Some(schema);
                ctx.args = args;
                ctx.enter(InvocationStage::FrameDecoded);
                Ok(Flow::Continue)
            }
            Err(e) => Ok(ctx.fail(ErrorKind::Decode, error_message(e))),
        }
    }

    fn admit(&self, ctx: &mut InvocationContext) -> Result<Flow> {
        let admitted = match &ctx.header {
            Some(header) => self.admission.admit(header),
            None => {
                let message = "Request reached admission undecoded".to_string();
                return Ok(ctx.fail(ErrorKind::Internal, message));
            }
        };

        match admitted {
            Ok(permit) => {
                ctx.permit = Some(permit);
                ctx.enter(InvocationStage::Admitted);
                Ok(Flow::Continue)
            }
            Err(e) => {
                tracing::debug!(
                    msg_id = ctx.msg_id(),
                    operation = %ctx.operation(),
                    error = %e,
                    "Request rejected"
                );
                Ok(ctx.fail(ErrorKind::AdmissionRejected, error_message(e)))
            }
        }
    }

    fn check_queue_timeout(&self, ctx: &mut InvocationContext) -> Result<Flow> {
        let waited = ctx
            .queued_at
            .map(|queued_at| queued_at.elapsed())
            .unwrap_or_default();

        if waited > ctx.queue_timeout {
            let waited_ms = waited.as_millis() as u64;
            tracing::warn!(
                msg_id = ctx.msg_id(),
                operation = %ctx.operation(),
                waited_ms,
                queue_timeout_ms = ctx.queue_timeout.as_millis() as u64,
                "Discarding request that waited too long in queue"
            );
            return Ok(ctx.expire_in_queue(waited_ms));
        }

        ctx.enter(InvocationStage::Executing);
        Ok(Flow::Continue)
    }

    async fn enqueue(self: &Arc<Self>, mut ctx: InvocationContext, sink: &ResponseSink) {
        if let Some(header) = &ctx.header {
            ctx.queue_timeout = self.queue_timeout.resolve(
                &header.dest_microservice,
                &header.schema_id,
                &header.operation_name,
            );
        }
        ctx.queued_at = Some(Instant::now());
        ctx.enter(InvocationStage::Queued);

        // The context follows the task only once the executor has taken it,
        // so a refusal can still be answered from here.
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let scheduler = self.clone();
        let worker_sink = sink.clone();
        let task = Box::pin(async move {
            if let Ok(ctx) = handoff_rx.await {
                scheduler.run_worker(ctx, worker_sink).await;
            }
        });

        match self.executor.execute(task) {
            Ok(()) => {
                if let Err(mut ctx) = handoff_tx.send(ctx) {
                    ctx.fail(ErrorKind::Internal, "Executor dropped the request".into());
                    self.respond(ctx, sink).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    msg_id = ctx.msg_id(),
                    operation = %ctx.operation(),
                    error = %e,
                    "Executor refused request"
                );
                ctx.fail(ErrorKind::AdmissionRejected, error_message(e));
                self.respond(ctx, sink).await;
            }
        }
    }

    async fn run_worker(self: Arc<Self>, mut ctx: InvocationContext, sink: ResponseSink) {
        match self.run_stages(WORKER_STAGES, &mut ctx) {
            Ok(Flow::Continue) => self.execute(&mut ctx).await,
            Ok(Flow::Respond) => {}
            Err(e) => {
                ctx.fail(ErrorKind::Internal, error_message(e));
            }
        }
        self.respond(ctx, &sink).await;
    }

    async fn execute(&self, ctx: &mut InvocationContext) {
        let Some(header) = ctx.header.clone() else {
            ctx.fail(ErrorKind::Internal, "Request reached execution undecoded".into());
            return;
        };
        let args = std::mem::take(&mut ctx.args);

        // Spawned so a panicking operation surfaces as a JoinError.
        let invocation = self.invoker.invoke(header, args);
        match tokio::spawn(invocation).await {
            Ok(outcome) => ctx.reply = Some(Reply::Outcome(outcome)),
            Err(e) => {
                tracing::error!(
                    msg_id = ctx.msg_id(),
                    operation = %ctx.operation(),
                    error = %e,
                    "Operation failed"
                );
                let message = if e.is_panic() {
                    "Operation panicked"
                } else {
                    "Operation cancelled"
                };
                ctx.fail(ErrorKind::Internal, message.to_string());
            }
        }
    }

    async fn respond(&self, mut ctx: InvocationContext, sink: &ResponseSink) {
        let msg_id = ctx.msg_id();
        let permit = ctx.permit.take();

        let frame = match encode_reply(&mut ctx, sink.encoding) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    msg_id,
                    operation = %ctx.operation(),
                    error = %e,
                    "Could not encode response"
                );
                let header = ResponseHeader::transport_error(ErrorKind::Internal);
                let message = Value::String(error_message(e));
                let encoded =
                    HighwayCodec::encode_response(msg_id, &header, None, &message, sink.encoding);
                match encoded {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(msg_id, error = %e, "Dropping response");
                        return;
                    }
                }
            }
        };

        match sink.writer.send(frame).await {
            Ok(()) => ctx.enter(InvocationStage::ResponseSent),
            Err(e) => {
                tracing::debug!(conn = sink.conn_id, msg_id, error = %e, "Response not delivered");
            }
        }
        // Released only once the response is queued on the writer.
        drop(permit);
    }
}

fn encode_reply(ctx: &mut InvocationContext, encoding: StructEncoding) -> Result<Frame> {
    let msg_id = ctx.msg_id();
    let reply = ctx.reply.take().unwrap_or(Reply::TransportError {
        kind: ErrorKind::Internal,
        message: "Request produced no outcome".into(),
        waited_ms: None,
    });

    match reply {
        Reply::Outcome(outcome) => {
            let mut header = ResponseHeader::new(outcome.status_code, outcome.reason_phrase);
            header.context = outcome.context;
            HighwayCodec::encode_response(
                msg_id,
                &header,
                ctx.schema.as_deref(),
                &outcome.value,
                encoding,
            )
        }
        Reply::TransportError {
            kind,
            message,
            waited_ms,
        } => {
            let mut header = ResponseHeader::transport_error(kind);
            if let Some(waited_ms) = waited_ms {
                header
                    .headers
                    .insert(QUEUE_WAITED_HEADER.to_string(), waited_ms.to_string());
            }
            HighwayCodec::encode_response(msg_id, &header, None, &Value::String(message), encoding)
        }
    }
}

/// The bare message of errors that already name their category.
fn error_message(err: HighwayError) -> String {
    match err {
        HighwayError::Decode(message)
        | HighwayError::Encode(message)
        | HighwayError::AdmissionRejected(message) => message,
        other => other.to_string(),
    }
}
