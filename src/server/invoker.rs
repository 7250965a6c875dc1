//! Seams between the transport and the application: the invoker that runs
//! an operation and the executor that supplies worker capacity.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::{HighwayError, Result};
use crate::protocol::RequestHeader;
use crate::BoxFuture;

/// Result of running an operation.
///
/// Non-2xx outcomes are business exceptions: the value is sent back as the
/// error payload and the connection stays healthy.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    /// Status sent in the response header.
    pub status_code: u16,
    /// Reason phrase sent in the response header.
    pub reason_phrase: String,
    /// Result on success, error payload otherwise.
    pub value: Value,
    /// Context returned to the caller.
    pub context: HashMap<String, String>,
}

impl InvokeOutcome {
    /// Successful result.
    pub fn ok(value: Value) -> Self {
        Self {
            status_code: 200,
            reason_phrase: "OK".to_string(),
            value,
            context: HashMap::new(),
        }
    }

    /// Application failure with its own status and payload.
    pub fn business_error(status_code: u16, reason: impl Into<String>, payload: Value) -> Self {
        Self {
            status_code,
            reason_phrase: reason.into(),
            value: payload,
            context: HashMap::new(),
        }
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Check for a 2xx status.
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Runs a decoded request.
pub trait Invoker: Send + Sync + 'static {
    /// Invoke the operation named by `header` with `args`.
    ///
    /// A panic inside the returned future is caught by the scheduler and
    /// answered as an internal error.
    fn invoke(&self, header: RequestHeader, args: Vec<Value>) -> BoxFuture<'static, InvokeOutcome>;
}

/// Supplies execution capacity for queued requests.
pub trait Executor: Send + Sync + 'static {
    /// Run `task` at some point. Must not block the caller.
    ///
    /// An executor that cannot take more work returns `AdmissionRejected`
    /// and drops `task` without running it.
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<()>;
}

/// Tokio tasks gated by a semaphore, so at most `size` requests execute
/// at once. Up to `max_queued` more wait for a worker, and that wait counts
/// as queue time. Anything beyond is refused on the spot.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    workers: Arc<Semaphore>,
    slots: Arc<Semaphore>,
    size: usize,
    max_queued: usize,
}

impl BoundedExecutor {
    /// Create an executor with `size` workers and room for `max_queued`
    /// waiting tasks.
    pub fn new(size: usize, max_queued: usize) -> Self {
        let size = size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(size)),
            slots: Arc::new(Semaphore::new(size.saturating_add(max_queued))),
            size,
            max_queued,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of idle workers.
    pub fn available(&self) -> usize {
        self.workers.available_permits()
    }

    /// Tasks accepted but not finished, running or waiting.
    pub fn in_flight(&self) -> usize {
        self.size.saturating_add(self.max_queued) - self.slots.available_permits()
    }
}

impl Executor for BoundedExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<()> {
        let slot = self.slots.clone().try_acquire_owned().map_err(|_| {
            HighwayError::AdmissionRejected(format!(
                "Worker pool saturated ({} running, {} queued)",
                self.size, self.max_queued
            ))
        })?;

        let workers = self.workers.clone();
        tokio::spawn(async move {
            let _slot = slot;
            // The semaphore is never closed; a failed acquire still runs the task.
            let _worker = workers.acquire_owned().await.ok();
            task.await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_outcome_constructors() {
        let ok = InvokeOutcome::ok(json!(1)).with_context("node", "a");
        assert!(ok.is_success());
        assert_eq!(ok.context.get("node").map(String::as_str), Some("a"));

        let failed = InvokeOutcome::business_error(490, "Rejected", json!({"code": 7}));
        assert!(!failed.is_success());
        assert_eq!(failed.reason_phrase, "Rejected");
    }

    #[tokio::test]
    async fn test_bounded_executor_caps_concurrency() {
        let executor = BoundedExecutor::new(2, 16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            executor
                .execute(Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                }))
                .unwrap();
        }

        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.available(), 2);
    }

    #[tokio::test]
    async fn test_bounded_executor_refuses_past_queue() {
        let executor = BoundedExecutor::new(1, 2);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        for _ in 0..3 {
            let mut release = release_rx.clone();
            executor
                .execute(Box::pin(async move {
                    let _ = release.wait_for(|go| *go).await;
                }))
                .unwrap();
        }
        assert_eq!(executor.in_flight(), 3);

        let refused = executor.execute(Box::pin(async {}));
        assert!(matches!(refused, Err(HighwayError::AdmissionRejected(_))));

        release_tx.send_replace(true);
        while executor.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(executor.execute(Box::pin(async {})).is_ok());
    }
}
