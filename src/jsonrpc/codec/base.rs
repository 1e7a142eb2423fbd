//! JSON-RPC 2.0 envelope

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::scan::{scan_str, scan_value, Envelope};
use super::{
    id_to_json, params_to_json, payload_to_json, resolve_params, resolve_result, CodecError, Dialect, MessageCodec, MessageIssue,
    MethodProvider,
};
use crate::jsonrpc::registry::MethodRegistry;
use crate::jsonrpc::types::{
    ErrorCode, Message, MessageId, NotificationMessage, RequestMessage, ResponseError, ResponseMessage,
    ResponseOutcome, JSONRPC_VERSION,
};

pub struct BaseCodec {
    registry: Arc<MethodRegistry>,
    next_id: AtomicI64,
}

impl BaseCodec {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            next_id: AtomicI64::new(1),
        }
    }

    fn resolve(
        &self,
        mut env: Envelope,
        scan_error: Option<serde_json::Error>,
        provider: &dyn MethodProvider,
    ) -> Result<Message, MessageIssue> {
        if let Some(error) = scan_error {
            return Err(MessageIssue::from_json_error(error, env.in_object).with_envelope(env.id, env.method));
        }

        if let Some(version) = env.version.as_deref() {
            if version != JSONRPC_VERSION {
                return Err(MessageIssue::new(
                    ErrorCode::InvalidRequest,
                    format!("Unsupported jsonrpc version '{}'", version),
                )
                .with_envelope(env.id, env.method));
            }
        }

        match (env.method.take(), env.id.take()) {
            (Some(method), Some(id)) => {
                let raw = env.take_field("params");
                match resolve_params(&self.registry, &method, raw) {
                    Ok(params) => Ok(RequestMessage { id, method, params }.into()),
                    Err(e) => Err(invalid_params(&method, e).with_envelope(Some(id), Some(method))),
                }
            }
            (Some(method), None) => {
                let raw = env.take_field("params");
                match resolve_params(&self.registry, &method, raw) {
                    Ok(params) => Ok(NotificationMessage { method, params }.into()),
                    Err(e) => Err(invalid_params(&method, e).with_envelope(None, Some(method))),
                }
            }
            (None, id) => {
                let has_outcome = env.fields.iter().any(|(key, _)| key == "result" || key == "error");
                if id.is_none() && !has_outcome {
                    return Err(MessageIssue::new(
                        ErrorCode::InvalidRequest,
                        "Message is neither a request, a notification nor a response",
                    ));
                }

                if let Some(raw) = env.take_field("error") {
                    let error: ResponseError = serde_json::from_value(raw).map_err(|e| {
                        MessageIssue::new(ErrorCode::InvalidRequest, format!("Malformed response error: {}", e))
                            .with_envelope(id.clone(), None)
                            .with_cause(e)
                    })?;
                    return Ok(ResponseMessage::error(id, error).into());
                }

                let method = id.as_ref().and_then(|id| provider.resolve_method(id));
                let result = resolve_result(&self.registry, method.as_deref(), env.take_field("result"));
                Ok(ResponseMessage {
                    id,
                    method: None,
                    outcome: ResponseOutcome::Result(result),
                }
                .into())
            }
        }
    }
}

fn invalid_params(method: &str, error: serde_json::Error) -> MessageIssue {
    MessageIssue::new(
        ErrorCode::InvalidParams,
        format!("Invalid params for '{}': {}", method, error),
    )
    .with_cause(error)
}

impl MessageCodec for BaseCodec {
    fn dialect(&self) -> Dialect {
        Dialect::Base
    }

    fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    fn next_request_id(&self) -> MessageId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        n.to_string().into()
    }

    fn decode_str(&self, text: &str, provider: &dyn MethodProvider) -> Result<Message, MessageIssue> {
        let (env, error) = scan_str(Dialect::Base, text);
        self.resolve(env, error, provider)
    }

    fn decode_value(&self, value: Value, provider: &dyn MethodProvider) -> Result<Message, MessageIssue> {
        let (env, error) = scan_value(Dialect::Base, value);
        self.resolve(env, error, provider)
    }

    fn encode(&self, message: &Message) -> Result<Value, CodecError> {
        let mut map = Map::new();
        map.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));

        match message {
            Message::Request(request) => {
                map.insert("id".to_string(), id_to_json(&request.id));
                map.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = params_to_json(&request.params, "params")? {
                    map.insert("params".to_string(), params);
                }
            }
            Message::Notification(notification) => {
                map.insert("method".to_string(), Value::String(notification.method.clone()));
                if let Some(params) = params_to_json(&notification.params, "params")? {
                    map.insert("params".to_string(), params);
                }
            }
            Message::Response(response) => {
                map.insert(
                    "id".to_string(),
                    response.id.as_ref().map_or(Value::Null, id_to_json),
                );
                match &response.outcome {
                    ResponseOutcome::Result(result) => {
                        let result = payload_to_json(result, "result")?.unwrap_or(Value::Null);
                        map.insert("result".to_string(), result);
                    }
                    ResponseOutcome::Error(error) => {
                        let error = serde_json::to_value(error)
                            .map_err(|source| CodecError::Serialize { what: "error", source })?;
                        map.insert("error".to_string(), error);
                    }
                }
            }
        }

        Ok(Value::Object(map))
    }
}
