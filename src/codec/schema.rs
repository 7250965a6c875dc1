//! Operation schemas and the process-wide schema registry.
//!
//! An [`OperationSchema`] describes how one operation's arguments and
//! results are laid out in frame bodies. Values are dynamically typed
//! (`serde_json::Value`); the transport never interprets them.
//!
//! Arguments follow the connection's [`StructEncoding`]: a name→value map
//! under `Named`, a positional array under `Compact`. Result bodies follow
//! a [`BodyLayout`] chosen by status code.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::{MsgPackCodec, StructEncoding};
use crate::error::{HighwayError, Result};

/// Layout of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLayout {
    /// Zero body bytes.
    Void,
    /// One MsgPack value.
    Value,
}

/// Codec descriptor for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSchema {
    schema_id: String,
    operation_name: String,
    params: Vec<String>,
    success_response: BodyLayout,
    error_response: BodyLayout,
}

impl OperationSchema {
    /// Operation with no parameters that returns a value.
    pub fn new(schema_id: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            schema_id: schema_id.into(),
            operation_name: operation_name.into(),
            params: Vec::new(),
            success_response: BodyLayout::Value,
            error_response: BodyLayout::Value,
        }
    }

    /// Append a named parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    /// Mark the success response as void.
    pub fn returns_void(mut self) -> Self {
        self.success_response = BodyLayout::Void;
        self
    }

    /// Schema id.
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Declared parameter names.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Body layout used for a response with this status code.
    pub fn response_layout(&self, status_code: u16) -> BodyLayout {
        if (200..300).contains(&status_code) {
            self.success_response
        } else {
            self.error_response
        }
    }

    /// Encode call arguments into a request body.
    pub fn encode_args(&self, args: &[Value], encoding: StructEncoding) -> Result<Vec<u8>> {
        if args.len() != self.params.len() {
            return Err(HighwayError::Encode(format!(
                "{} expects {} arguments, got {}",
                self.operation_name,
                self.params.len(),
                args.len()
            )));
        }

        if self.params.is_empty() {
            return Ok(Vec::new());
        }

        match encoding {
            StructEncoding::Named => {
                let map: Map<String, Value> = self
                    .params
                    .iter()
                    .cloned()
                    .zip(args.iter().cloned())
                    .collect();
                MsgPackCodec::encode(&map, encoding)
            }
            StructEncoding::Compact => MsgPackCodec::encode(args, encoding),
        }
    }

    /// Decode a request body into call arguments, in parameter order.
    ///
    /// Named bodies may omit parameters; they decode as `null`.
    pub fn decode_args(&self, body: &[u8]) -> Result<Vec<Value>> {
        if self.params.is_empty() {
            if !body.is_empty() {
                return Err(HighwayError::Decode(format!(
                    "{} takes no arguments but body has {} bytes",
                    self.operation_name,
                    body.len()
                )));
            }
            return Ok(Vec::new());
        }

        if body.is_empty() {
            return Err(HighwayError::Decode(format!(
                "{} expects {} arguments but body is empty",
                self.operation_name,
                self.params.len()
            )));
        }

        match MsgPackCodec::decode::<Value>(body)? {
            Value::Object(mut map) => Ok(self
                .params
                .iter()
                .map(|name| map.remove(name).unwrap_or(Value::Null))
                .collect()),
            Value::Array(items) if items.len() == self.params.len() => Ok(items),
            Value::Array(items) => Err(HighwayError::Decode(format!(
                "{} expects {} arguments, body has {}",
                self.operation_name,
                self.params.len(),
                items.len()
            ))),
            other => Err(HighwayError::Decode(format!(
                "Arguments must be a map or array, got {}",
                other
            ))),
        }
    }

    /// Encode a result or error payload for the given status.
    pub fn encode_result(
        &self,
        status_code: u16,
        value: &Value,
        encoding: StructEncoding,
    ) -> Result<Vec<u8>> {
        match self.response_layout(status_code) {
            BodyLayout::Void if value.is_null() => Ok(Vec::new()),
            BodyLayout::Void => Err(HighwayError::Encode(format!(
                "{} returns void but produced a value",
                self.operation_name
            ))),
            BodyLayout::Value => MsgPackCodec::encode(value, encoding),
        }
    }

    /// Decode a response body for the given status. Void decodes as `null`.
    pub fn decode_result(&self, status_code: u16, body: &[u8]) -> Result<Value> {
        match self.response_layout(status_code) {
            BodyLayout::Void if body.is_empty() => Ok(Value::Null),
            BodyLayout::Void => Err(HighwayError::Decode(format!(
                "{} returns void but body has {} bytes",
                self.operation_name,
                body.len()
            ))),
            BodyLayout::Value if body.is_empty() => Err(HighwayError::Decode(format!(
                "{} response body is empty",
                self.operation_name
            ))),
            BodyLayout::Value => MsgPackCodec::decode(body),
        }
    }
}

/// Registry of operation schemas keyed by schema id and operation name.
///
/// Constructed explicitly and shared by `Arc`; lookups hand out the same
/// `Arc<OperationSchema>` for the life of the registry.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, HashMap<String, Arc<OperationSchema>>>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one with the same key.
    pub fn register(&self, schema: OperationSchema) -> Arc<OperationSchema> {
        let schema = Arc::new(schema);
        self.schemas
            .write()
            .entry(schema.schema_id.clone())
            .or_default()
            .insert(schema.operation_name.clone(), schema.clone());
        schema
    }

    /// Look up an operation.
    pub fn find(&self, schema_id: &str, operation_name: &str) -> Option<Arc<OperationSchema>> {
        self.schemas
            .read()
            .get(schema_id)
            .and_then(|ops| ops.get(operation_name))
            .cloned()
    }

    /// Look up an operation, failing with a `Decode` error if it is unknown.
    pub fn ensure_find(
        &self,
        schema_id: &str,
        operation_name: &str,
    ) -> Result<Arc<OperationSchema>> {
        self.find(schema_id, operation_name).ok_or_else(|| {
            HighwayError::Decode(format!(
                "Unknown operation {}.{}",
                schema_id, operation_name
            ))
        })
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.schemas.read().values().map(HashMap::len).sum()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
