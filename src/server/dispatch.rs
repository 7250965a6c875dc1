//! Operation dispatcher: routes requests to registered handlers by
//! `(schema_id, operation_name)`.
//!
//! # Example
//!
//! ```ignore
//! use highway_transport::server::{InvokeOutcome, OperationDispatcher};
//!
//! let mut dispatcher = OperationDispatcher::new();
//! dispatcher.register("hello", "echo", |_header, mut args| async move {
//!     InvokeOutcome::ok(args.remove(0))
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde_json::Value;

use super::invoker::{InvokeOutcome, Invoker};
use crate::protocol::RequestHeader;
use crate::BoxFuture;

/// Status returned when no handler is registered for an operation.
pub const NOT_IMPLEMENTED: u16 = 501;

/// A registered operation handler.
pub trait OperationHandler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, header: RequestHeader, args: Vec<Value>) -> BoxFuture<'static, InvokeOutcome>;
}

/// Adapts an async closure to [`OperationHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(RequestHeader, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeOutcome> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(RequestHeader, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeOutcome> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> OperationHandler for FnHandler<F, Fut>
where
    F: Fn(RequestHeader, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeOutcome> + Send + 'static,
{
    fn call(&self, header: RequestHeader, args: Vec<Value>) -> BoxFuture<'static, InvokeOutcome> {
        Box::pin((self.handler)(header, args))
    }
}

/// Handler table keyed by schema, then operation.
#[derive(Default)]
pub struct OperationDispatcher {
    handlers: HashMap<String, HashMap<String, Box<dyn OperationHandler>>>,
}

impl OperationDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `schema_id.operation_name`, replacing any
    /// previous handler.
    pub fn register<F, Fut>(&mut self, schema_id: &str, operation_name: &str, handler: F)
    where
        F: Fn(RequestHeader, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeOutcome> + Send + 'static,
    {
        self.handlers
            .entry(schema_id.to_string())
            .or_default()
            .insert(operation_name.to_string(), Box::new(FnHandler::new(handler)));
    }

    /// Look up a handler.
    pub fn get_handler(
        &self,
        schema_id: &str,
        operation_name: &str,
    ) -> Option<&dyn OperationHandler> {
        self.handlers
            .get(schema_id)
            .and_then(|ops| ops.get(operation_name))
            .map(|h| h.as_ref())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Invoker for OperationDispatcher {
    fn invoke(&self, header: RequestHeader, args: Vec<Value>) -> BoxFuture<'static, InvokeOutcome> {
        match self.get_handler(&header.schema_id, &header.operation_name) {
            Some(handler) => handler.call(header, args),
            None => {
                let name = header.qualified_name();
                Box::pin(async move {
                    InvokeOutcome::business_error(
                        NOT_IMPLEMENTED,
                        "Not Implemented",
                        Value::String(format!("No handler for {}", name)),
                    )
                })
            }
        }
    }
}

impl std::fmt::Debug for OperationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDispatcher")
            .field("handlers", &self.len())
            .finish()
    }
}
