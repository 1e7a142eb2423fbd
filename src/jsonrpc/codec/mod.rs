//! Message codecs for the two wire dialects.
//!
//! - [`BaseCodec`]: JSON-RPC 2.0 envelopes (`jsonrpc`/`id`/`method`/`params`/`result`/`error`)
//! - [`DebugCodec`]: the debug adapter envelope (`seq`/`type`/`command`/`event`/`success`/`body`)
//!
//! Both decode in two passes: the object is scanned once into an envelope of
//! eagerly decoded scalars plus raw payload trees, then the payloads are
//! resolved through the [`MethodRegistry`]. Response payloads are resolved
//! through a [`MethodProvider`], which maps the response id back to the
//! method of the request it answers.

mod base;
mod debug;
mod scan;

pub use base::BaseCodec;
pub use debug::DebugCodec;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::payload::Payload;
use super::registry::MethodRegistry;
use super::types::{ErrorCode, Message, MessageId, ResponseError};

/// Wire envelope family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Base,
    Debug,
}

impl Dialect {
    /// Parse a dialect name, accepting common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "base" | "jsonrpc" | "json-rpc" | "lsp" => Some(Dialect::Base),
            "debug" | "dap" => Some(Dialect::Debug),
            _ => None,
        }
    }

    /// Create the codec for this dialect.
    pub fn codec(self, registry: Arc<MethodRegistry>) -> Arc<dyn MessageCodec> {
        match self {
            Dialect::Base => Arc::new(BaseCodec::new(registry)),
            Dialect::Debug => Arc::new(DebugCodec::new(registry)),
        }
    }
}

/// Maps the id of a request sent by this side to its method name
pub trait MethodProvider: Send + Sync {
    fn resolve_method(&self, id: &MessageId) -> Option<String>;
}

/// Provider for contexts where no request is outstanding
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPendingRequests;

impl MethodProvider for NoPendingRequests {
    fn resolve_method(&self, _id: &MessageId) -> Option<String> {
        None
    }
}

/// A message that could not be decoded.
///
/// Carries whatever part of the envelope was read before the failure so that
/// a malformed request can still be answered.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct MessageIssue {
    code: ErrorCode,
    message: String,
    id: Option<MessageId>,
    method: Option<String>,
    #[source]
    cause: Option<serde_json::Error>,
}

impl MessageIssue {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            id: None,
            method: None,
            cause: None,
        }
    }

    /// Syntax errors and non-object input are parse errors; a field of the wrong type makes the request invalid.
    pub(crate) fn from_json_error(error: serde_json::Error, in_object: bool) -> Self {
        let code = if in_object && error.is_data() {
            ErrorCode::InvalidRequest
        } else {
            ErrorCode::ParseError
        };
        Self {
            code,
            message: format!("Message could not be parsed: {}", error),
            id: None,
            method: None,
            cause: Some(error),
        }
    }

    pub fn with_envelope(mut self, id: Option<MessageId>, method: Option<String>) -> Self {
        self.id = id;
        self.method = method;
        self
    }

    pub(crate) fn with_cause(mut self, cause: serde_json::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn cause(&self) -> Option<&serde_json::Error> {
        self.cause.as_ref()
    }

    /// A request whose id and method were read can be answered with an error response.
    pub fn is_answerable(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    pub fn to_response_error(&self) -> ResponseError {
        ResponseError::new(self.code, self.message.clone())
    }
}

/// Failures while turning a message into JSON
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("message id '{0}' is not a valid sequence number")]
    InvalidSequence(MessageId),
}

pub trait MessageCodec: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn registry(&self) -> &MethodRegistry;

    /// Allocate the id of the next request this side originates.
    fn next_request_id(&self) -> MessageId;

    fn decode_str(&self, text: &str, provider: &dyn MethodProvider) -> Result<Message, MessageIssue>;

    fn decode_value(&self, value: Value, provider: &dyn MethodProvider) -> Result<Message, MessageIssue>;

    fn encode(&self, message: &Message) -> Result<Value, CodecError>;

    fn encode_string(&self, message: &Message) -> Result<String, CodecError> {
        let value = self.encode(message)?;
        serde_json::to_string(&value).map_err(|source| CodecError::Serialize {
            what: "message",
            source,
        })
    }
}

pub(crate) fn id_to_json(id: &MessageId) -> Value {
    match id {
        MessageId::Number(n) => Value::from(*n),
        MessageId::String(s) => Value::String(s.clone()),
    }
}

pub(crate) fn payload_to_json(payload: &Payload, what: &'static str) -> Result<Option<Value>, CodecError> {
    payload
        .to_json()
        .map_err(|source| CodecError::Serialize { what, source })
}

/// Params-like payloads are omitted from the envelope when absent or `null`.
pub(crate) fn params_to_json(payload: &Payload, what: &'static str) -> Result<Option<Value>, CodecError> {
    Ok(payload_to_json(payload, what)?.filter(|value| !value.is_null()))
}

/// Resolve request/notification params through the registry.
pub(crate) fn resolve_params(
    registry: &MethodRegistry,
    method: &str,
    raw: Option<Value>,
) -> serde_json::Result<Payload> {
    let Some(raw) = raw else {
        return Ok(Payload::None);
    };
    match registry.get(method) {
        Some(descriptor) => descriptor.params().decode(raw),
        None => Ok(Payload::Json(raw)),
    }
}

/// Resolve a response result; falls back to the raw tree when no type can be determined.
pub(crate) fn resolve_result(registry: &MethodRegistry, method: Option<&str>, raw: Option<Value>) -> Payload {
    let Some(raw) = raw else {
        return Payload::None;
    };
    let shape = method
        .and_then(|m| registry.get(m))
        .and_then(|descriptor| descriptor.result());
    match shape {
        Some(shape) => match shape.decode(raw.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!(
                    "Result of '{}' does not match {}: {}; keeping raw JSON",
                    method.unwrap_or_default(),
                    shape.type_name(),
                    e
                );
                Payload::Json(raw)
            }
        },
        None => Payload::Json(raw),
    }
}
