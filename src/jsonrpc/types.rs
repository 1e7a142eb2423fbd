use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::payload::Payload;

/// JSONRPC version - MUST be exactly "2.0"
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved notification used to cancel a previously sent request.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Request identifier (string or number on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl MessageId {
    /// Numeric view of the id, used by the debug envelope which only knows `seq` numbers.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MessageId::Number(n) => Some(*n),
            MessageId::String(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{}", n),
            MessageId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        MessageId::Number(n)
    }
}

impl From<i32> for MessageId {
    fn from(n: i32) -> Self {
        MessageId::Number(n as i64)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId::String(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId::String(s.to_string())
    }
}

/// Parameters of the reserved cancellation notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: MessageId,
}

/// Pre-defined JSONRPC error codes plus the protocol-level codes editors use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    ServerNotInitialized = -32002,
    UnknownErrorCode = -32001,
    RequestFailed = -32803,
    ServerCancelled = -32802,
    ContentModified = -32801,
    RequestCancelled = -32800,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerNotInitialized => "Server not initialized",
            ErrorCode::UnknownErrorCode => "Unknown error",
            ErrorCode::RequestFailed => "Request failed",
            ErrorCode::ServerCancelled => "Server cancelled",
            ErrorCode::ContentModified => "Content modified",
            ErrorCode::RequestCancelled => "Request cancelled",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let known = [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::ServerNotInitialized,
            ErrorCode::UnknownErrorCode,
            ErrorCode::RequestFailed,
            ErrorCode::ServerCancelled,
            ErrorCode::ContentModified,
            ErrorCode::RequestCancelled,
        ];
        known.into_iter().find(|c| c.code() == code)
    }
}

/// JSONRPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ResponseError {
    /// Error type indicator (must be integer)
    pub code: i32,

    /// Short error description
    pub message: String,

    /// Additional error information (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Create an error with one of the well-known codes
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an error with the default message of the code
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.message())
    }

    /// Create a custom error
    pub fn custom(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// A message expecting exactly one response
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub id: MessageId,
    pub method: String,
    pub params: Payload,
}

impl RequestMessage {
    pub fn new(id: impl Into<MessageId>, method: impl Into<String>, params: Payload) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub params: Payload,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Payload) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Result or error of a response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Payload),
    Error(ResponseError),
}

/// Answer to a request.
///
/// `id` is `None` only when answering a message whose id could not be read.
/// `method` is carried by the debug envelope (`command`) and is `None` for
/// base-dialect responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: Option<MessageId>,
    pub method: Option<String>,
    pub outcome: ResponseOutcome,
}

impl ResponseMessage {
    /// Create a success response
    pub fn success(id: MessageId, result: Payload) -> Self {
        Self {
            id: Some(id),
            method: None,
            outcome: ResponseOutcome::Result(result),
        }
    }

    /// Create an error response
    pub fn error(id: Option<MessageId>, error: ResponseError) -> Self {
        Self {
            id,
            method: None,
            outcome: ResponseOutcome::Error(error),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Result(_))
    }
}

/// Any of the three message kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(r) => r.method.as_deref(),
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Notification(_) => None,
            Message::Response(r) => r.id.as_ref(),
        }
    }
}

impl From<RequestMessage> for Message {
    fn from(m: RequestMessage) -> Self {
        Message::Request(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Self {
        Message::Notification(m)
    }
}

impl From<ResponseMessage> for Message {
    fn from(m: ResponseMessage) -> Self {
        Message::Response(m)
    }
}
