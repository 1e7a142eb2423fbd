//! Debug adapter envelope.
//!
//! Every message carries a `seq` and a `type` of `request`, `event` or
//! `response`. Requests name their method in `command`, events in `event`;
//! payloads travel in `arguments` (requests) or `body` (events, responses).
//! A response points at its request through `request_seq` and usually repeats
//! the `command`, so its body can be resolved even without a pending entry.

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::scan::{scan_str, scan_value, Envelope};
use super::{
    params_to_json, resolve_params, resolve_result, CodecError, Dialect, MessageCodec, MessageIssue,
    MethodProvider,
};
use crate::jsonrpc::registry::MethodRegistry;
use crate::jsonrpc::types::{
    ErrorCode, Message, MessageId, NotificationMessage, RequestMessage, ResponseError, ResponseMessage,
    ResponseOutcome,
};

const REQUEST: &str = "request";
const EVENT: &str = "event";
const RESPONSE: &str = "response";

/// Sequence numbers of requests, events and responses share one counter.
pub struct DebugCodec {
    registry: Arc<MethodRegistry>,
    next_seq: AtomicI64,
}

impl DebugCodec {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            next_seq: AtomicI64::new(1),
        }
    }

    fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn resolve(
        &self,
        mut env: Envelope,
        scan_error: Option<serde_json::Error>,
        provider: &dyn MethodProvider,
    ) -> Result<Message, MessageIssue> {
        if let Some(error) = scan_error {
            let id = envelope_id(&env);
            return Err(MessageIssue::from_json_error(error, env.in_object).with_envelope(id, env.method));
        }

        let kind = env.kind.clone();
        match kind.as_deref() {
            Some(REQUEST) => {
                let Some(seq) = env.seq else {
                    return Err(invalid(&env, "Request without 'seq'"));
                };
                let Some(method) = env.method.take() else {
                    return Err(invalid(&env, "Request without 'command'"));
                };
                let id = MessageId::Number(seq);
                match resolve_params(&self.registry, &method, env.take_field("arguments")) {
                    Ok(params) => Ok(RequestMessage { id, method, params }.into()),
                    Err(e) => Err(invalid_params(&method, e).with_envelope(Some(id), Some(method))),
                }
            }
            Some(EVENT) => {
                let Some(method) = env.method.take() else {
                    return Err(invalid(&env, "Event without 'event' name"));
                };
                match resolve_params(&self.registry, &method, env.take_field("body")) {
                    Ok(params) => Ok(NotificationMessage { method, params }.into()),
                    Err(e) => Err(invalid_params(&method, e).with_envelope(None, Some(method))),
                }
            }
            Some(RESPONSE) => {
                let Some(request_seq) = env.request_seq else {
                    return Err(invalid(&env, "Response without 'request_seq'"));
                };
                let id = MessageId::Number(request_seq);
                let body = env.take_field("body");

                let outcome = if env.success.unwrap_or(true) {
                    let method = env.method.clone().or_else(|| provider.resolve_method(&id));
                    ResponseOutcome::Result(resolve_result(&self.registry, method.as_deref(), body))
                } else {
                    ResponseOutcome::Error(error_from_body(env.message.take(), body))
                };

                Ok(ResponseMessage {
                    id: Some(id),
                    method: env.method,
                    outcome,
                }
                .into())
            }
            Some(other) => {
                let message = format!("Unknown message type '{}'", other);
                Err(invalid(&env, &message))
            }
            None => Err(invalid(&env, "Message without 'type'")),
        }
    }
}

/// Id a malformed message would be answered with
fn envelope_id(env: &Envelope) -> Option<MessageId> {
    match env.kind.as_deref() {
        Some(EVENT) => None,
        Some(RESPONSE) => env.request_seq.map(MessageId::Number),
        _ => env.seq.map(MessageId::Number),
    }
}

fn invalid(env: &Envelope, message: &str) -> MessageIssue {
    MessageIssue::new(ErrorCode::InvalidRequest, message).with_envelope(envelope_id(env), env.method.clone())
}

fn invalid_params(method: &str, error: serde_json::Error) -> MessageIssue {
    MessageIssue::new(
        ErrorCode::InvalidParams,
        format!("Invalid arguments for '{}': {}", method, error),
    )
    .with_cause(error)
}

/// `body.error` is `{"id": code, "format": message, "data"?: ..}`
fn error_from_body(message: Option<String>, body: Option<Value>) -> ResponseError {
    let detail = body
        .as_ref()
        .and_then(|body| body.get("error"))
        .and_then(|error| {
            let code = error.get("id")?.as_i64()?;
            let format = error.get("format")?.as_str()?;
            Some((code, format.to_string(), error.get("data").cloned()))
        });

    match detail {
        Some((code, format, data)) => ResponseError::custom(code as i32, format, data),
        None => ResponseError::custom(
            ErrorCode::UnknownErrorCode.code(),
            message.unwrap_or_else(|| ErrorCode::UnknownErrorCode.message().to_string()),
            body,
        ),
    }
}

fn sequence(id: &MessageId) -> Result<i64, CodecError> {
    id.as_i64().ok_or_else(|| CodecError::InvalidSequence(id.clone()))
}

impl MessageCodec for DebugCodec {
    fn dialect(&self) -> Dialect {
        Dialect::Debug
    }

    fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    fn next_request_id(&self) -> MessageId {
        MessageId::Number(self.next_seq())
    }

    fn decode_str(&self, text: &str, provider: &dyn MethodProvider) -> Result<Message, MessageIssue> {
        let (env, error) = scan_str(Dialect::Debug, text);
        self.resolve(env, error, provider)
    }

    fn decode_value(&self, value: Value, provider: &dyn MethodProvider) -> Result<Message, MessageIssue> {
        let (env, error) = scan_value(Dialect::Debug, value);
        self.resolve(env, error, provider)
    }

    fn encode(&self, message: &Message) -> Result<Value, CodecError> {
        let mut map = Map::new();

        match message {
            Message::Request(request) => {
                map.insert("seq".to_string(), Value::from(sequence(&request.id)?));
                map.insert("type".to_string(), Value::from(REQUEST));
                map.insert("command".to_string(), Value::String(request.method.clone()));
                if let Some(arguments) = params_to_json(&request.params, "arguments")? {
                    map.insert("arguments".to_string(), arguments);
                }
            }
            Message::Notification(notification) => {
                map.insert("seq".to_string(), Value::from(self.next_seq()));
                map.insert("type".to_string(), Value::from(EVENT));
                map.insert("event".to_string(), Value::String(notification.method.clone()));
                if let Some(body) = params_to_json(&notification.params, "body")? {
                    map.insert("body".to_string(), body);
                }
            }
            Message::Response(response) => {
                let request_seq = match &response.id {
                    Some(id) => sequence(id)?,
                    None => 0,
                };
                map.insert("seq".to_string(), Value::from(self.next_seq()));
                map.insert("type".to_string(), Value::from(RESPONSE));
                map.insert("request_seq".to_string(), Value::from(request_seq));
                map.insert("success".to_string(), Value::Bool(response.is_success()));
                if let Some(command) = &response.method {
                    map.insert("command".to_string(), Value::String(command.clone()));
                }
                match &response.outcome {
                    ResponseOutcome::Result(result) => {
                        if let Some(body) = params_to_json(result, "body")? {
                            map.insert("body".to_string(), body);
                        }
                    }
                    ResponseOutcome::Error(error) => {
                        let mut detail = json!({"id": error.code, "format": error.message});
                        if let Some(data) = &error.data {
                            detail["data"] = data.clone();
                        }
                        map.insert("message".to_string(), Value::String(error.message.clone()));
                        map.insert("body".to_string(), json!({ "error": detail }));
                    }
                }
            }
        }

        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::codec::NoPendingRequests;
    use crate::jsonrpc::payload::Payload;
    use crate::jsonrpc::registry::ServiceGroup;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct InitializeRequestArguments {
        #[serde(rename = "clientID")]
        client_id: String,
        #[serde(rename = "adapterID")]
        adapter_id: String,
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Capabilities {
        #[serde(default)]
        supports_configuration_done_request: bool,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OutputEventArguments {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        category: Option<String>,
        output: String,
    }

    struct Pending(&'static str);

    impl MethodProvider for Pending {
        fn resolve_method(&self, _id: &MessageId) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn codec() -> DebugCodec {
        let registry = MethodRegistry::builder()
            .group(
                ServiceGroup::new("adapter")
                    .request::<InitializeRequestArguments, Capabilities>("initialize")
                    .request::<Value, Value>("next"),
            )
            .group(ServiceGroup::new("client").notification::<OutputEventArguments>("output"))
            .local("adapter")
            .remote("client")
            .build()
            .unwrap();
        DebugCodec::new(Arc::new(registry))
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let codec = codec();
        let in_order = codec
            .decode_str(
                r#"{"seq":1,"type":"request","command":"initialize","arguments":{"clientID":"vscode","adapterID":"mock"}}"#,
                &NoPendingRequests,
            )
            .unwrap();
        let reversed = codec
            .decode_str(
                r#"{"arguments":{"adapterID":"mock","clientID":"vscode"},"command":"initialize","type":"request","seq":1}"#,
                &NoPendingRequests,
            )
            .unwrap();
        assert_eq!(in_order, reversed);

        let Message::Request(request) = reversed else {
            panic!("expected request");
        };
        assert_eq!(request.id, MessageId::from(1));
        assert!(request.params.downcast_ref::<InitializeRequestArguments>().is_some());
    }

    #[test]
    fn test_response_body_resolved_by_command() {
        let message = codec()
            .decode_str(
                r#"{"body":{"supportsConfigurationDoneRequest":true},"success":true,"command":"initialize","request_seq":1,"type":"response","seq":2}"#,
                &NoPendingRequests,
            )
            .unwrap();
        let Message::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.id, Some(MessageId::from(1)));
        assert_eq!(response.method.as_deref(), Some("initialize"));
        let ResponseOutcome::Result(body) = response.outcome else {
            panic!("expected success");
        };
        assert_eq!(
            body.downcast_ref::<Capabilities>(),
            Some(&Capabilities {
                supports_configuration_done_request: true
            })
        );
    }

    #[test]
    fn test_response_body_resolved_by_provider() {
        let message = codec()
            .decode_str(
                r#"{"type":"response","seq":3,"request_seq":1,"success":true,"body":{}}"#,
                &Pending("initialize"),
            )
            .unwrap();
        let Message::Response(ResponseMessage {
            outcome: ResponseOutcome::Result(body),
            ..
        }) = message
        else {
            panic!("expected success");
        };
        assert_eq!(body.downcast_ref::<Capabilities>(), Some(&Capabilities::default()));
    }

    #[test]
    fn test_output_event() {
        let message = codec()
            .decode_str(
                r#"{"seq":5,"type":"event","event":"output","body":{"category":"stdout","output":"hello\n"}}"#,
                &NoPendingRequests,
            )
            .unwrap();
        let Message::Notification(notification) = message else {
            panic!("expected event");
        };
        assert_eq!(notification.method, "output");
        assert_eq!(
            notification.params.downcast_ref::<OutputEventArguments>(),
            Some(&OutputEventArguments {
                category: Some("stdout".to_string()),
                output: "hello\n".to_string(),
            })
        );
    }

    #[test]
    fn test_truncated_request_keeps_id_and_command() {
        let issue = codec()
            .decode_str(r#"{"type":"request","seq":2,"command":"foo""#, &NoPendingRequests)
            .unwrap_err();
        assert_eq!(issue.code(), ErrorCode::ParseError);
        assert_eq!(issue.id(), Some(&MessageId::from(2)));
        assert_eq!(issue.method(), Some("foo"));
        assert!(issue.is_answerable());
    }

    #[test]
    fn test_invalid_envelopes() {
        let codec = codec();

        let issue = codec
            .decode_str(r#"{"seq":1,"type":"reverse","command":"x"}"#, &NoPendingRequests)
            .unwrap_err();
        assert_eq!(issue.code(), ErrorCode::InvalidRequest);

        let issue = codec
            .decode_str(r#"{"type":"request","command":"next"}"#, &NoPendingRequests)
            .unwrap_err();
        assert_eq!(issue.code(), ErrorCode::InvalidRequest);
        assert!(!issue.is_answerable());

        let issue = codec.decode_str(r#"{"seq":1,"command":"next"}"#, &NoPendingRequests).unwrap_err();
        assert_eq!(issue.code(), ErrorCode::InvalidRequest);

        let issue = codec
            .decode_str(
                r#"{"seq":4,"type":"request","command":"initialize","arguments":{"clientID":1}}"#,
                &NoPendingRequests,
            )
            .unwrap_err();
        assert_eq!(issue.code(), ErrorCode::InvalidParams);
        assert_eq!(issue.id(), Some(&MessageId::from(4)));
    }

    #[test]
    fn test_error_response_round_trip() {
        let codec = codec();
        let error = ResponseError::custom(1014, "Unable to step", Some(json!({"thread": 1})));
        let response = ResponseMessage::error(Some(MessageId::from(7)), error.clone()).with_method("next");

        let value = codec.encode(&response.clone().into()).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["request_seq"], 7);
        assert_eq!(value["success"], false);
        assert_eq!(value["command"], "next");
        assert_eq!(value["message"], "Unable to step");
        assert_eq!(
            value["body"],
            json!({"error": {"id": 1014, "format": "Unable to step", "data": {"thread": 1}}})
        );

        let decoded = codec.decode_value(value, &NoPendingRequests).unwrap();
        assert_eq!(decoded, Message::Response(response));
    }

    #[test]
    fn test_failed_response_without_error_body() {
        let message = codec()
            .decode_str(
                r#"{"seq":9,"type":"response","request_seq":3,"success":false,"command":"next","message":"cancelled"}"#,
                &NoPendingRequests,
            )
            .unwrap();
        let Message::Response(ResponseMessage {
            outcome: ResponseOutcome::Error(error),
            ..
        }) = message
        else {
            panic!("expected error");
        };
        assert_eq!(error.error_code(), Some(ErrorCode::UnknownErrorCode));
        assert_eq!(error.message, "cancelled");
        assert_eq!(error.data, None);
    }

    #[test]
    fn test_encode_shares_sequence_counter() {
        let codec = codec();
        let id = codec.next_request_id();
        assert_eq!(id, MessageId::from(1));

        let request = codec
            .encode(&RequestMessage::new(id, "next", Payload::json(json!({"threadId": 1}))).into())
            .unwrap();
        assert_eq!(
            request,
            json!({"seq": 1, "type": "request", "command": "next", "arguments": {"threadId": 1}})
        );

        let event = codec
            .encode(
                &NotificationMessage::new(
                    "output",
                    Payload::typed(OutputEventArguments {
                        category: None,
                        output: "x".to_string(),
                    }),
                )
                .into(),
            )
            .unwrap();
        assert_eq!(event, json!({"seq": 2, "type": "event", "event": "output", "body": {"output": "x"}}));

        let response = codec
            .encode(&ResponseMessage::success(MessageId::from(1), Payload::None).into())
            .unwrap();
        assert_eq!(
            response,
            json!({"seq": 3, "type": "response", "request_seq": 1, "success": true})
        );
        assert_eq!(codec.next_request_id(), MessageId::from(4));
    }

    #[test]
    fn test_non_numeric_id_cannot_be_encoded() {
        let error = codec()
            .encode(&RequestMessage::new("abc", "next", Payload::None).into())
            .unwrap_err();
        assert!(matches!(error, CodecError::InvalidSequence(_)));
    }

    #[test]
    fn test_request_round_trip() {
        let codec = codec();
        let original: Message = RequestMessage::new(
            12,
            "initialize",
            Payload::typed(InitializeRequestArguments {
                client_id: "c".to_string(),
                adapter_id: "a".to_string(),
            }),
        )
        .into();
        let text = codec.encode_string(&original).unwrap();
        assert_eq!(codec.decode_str(&text, &NoPendingRequests).unwrap(), original);
    }
}
