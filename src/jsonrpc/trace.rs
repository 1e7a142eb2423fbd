//! Human-readable message trace.
//!
//! Produces the trace format editors show in their output panels:
//!
//! ```text
//! [Trace - 10:21:05 AM] Sending request 'initialize - (1)'.
//! Params: {
//!   "clientID": "vscode"
//! }
//! ```
//!
//! Responses are matched with the requests the tracer saw so the round-trip
//! (or processing) time can be reported.

use chrono::Local;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use super::payload::Payload;
use super::types::{CancelParams, Message, MessageId, NotificationMessage, ResponseOutcome, CANCEL_METHOD};

struct Started {
    method: String,
    at: Instant,
}

pub struct MessageTracer {
    out: Mutex<Box<dyn Write + Send>>,
    sent_requests: Mutex<HashMap<MessageId, Started>>,
    received_requests: Mutex<HashMap<MessageId, Started>>,
}

impl MessageTracer {
    pub fn new<W: Write + Send + 'static>(out: W) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
            sent_requests: Mutex::new(HashMap::new()),
            received_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }

    pub fn on_sent(&self, message: &Message) {
        let entry = match message {
            Message::Request(request) => {
                remember(&self.sent_requests, &request.id, &request.method);
                format!(
                    "Sending request '{} - ({})'.\n{}",
                    request.method,
                    request.id,
                    section("Params", &request.params)
                )
            }
            Message::Notification(notification) => {
                forget_cancelled(&self.sent_requests, notification);
                format!(
                    "Sending notification '{}'.\n{}",
                    notification.method,
                    section("Params", &notification.params)
                )
            }
            Message::Response(response) => {
                let started = response.id.as_ref().and_then(|id| take(&self.received_requests, id));
                let id = response.id.as_ref().map_or_else(|| "?".to_string(), |id| id.to_string());
                match started {
                    Some(started) => format!(
                        "Sending response '{} - ({})'. Processing request took {}ms\n{}",
                        started.method,
                        id,
                        started.at.elapsed().as_millis(),
                        outcome(&response.outcome)
                    ),
                    None => format!(
                        "Sending response '{} - ({})'.\n{}",
                        response.method.as_deref().unwrap_or("unknown"),
                        id,
                        outcome(&response.outcome)
                    ),
                }
            }
        };
        self.write(&entry);
    }

    pub fn on_received(&self, message: &Message) {
        let entry = match message {
            Message::Request(request) => {
                remember(&self.received_requests, &request.id, &request.method);
                format!(
                    "Received request '{} - ({})'.\n{}",
                    request.method,
                    request.id,
                    section("Params", &request.params)
                )
            }
            Message::Notification(notification) => {
                forget_cancelled(&self.received_requests, notification);
                format!(
                    "Received notification '{}'.\n{}",
                    notification.method,
                    section("Params", &notification.params)
                )
            }
            Message::Response(response) => {
                let started = response.id.as_ref().and_then(|id| take(&self.sent_requests, id));
                let id = response.id.as_ref().map_or_else(|| "?".to_string(), |id| id.to_string());
                match started {
                    Some(started) => format!(
                        "Received response '{} - ({})' in {}ms.\n{}",
                        started.method,
                        id,
                        started.at.elapsed().as_millis(),
                        outcome(&response.outcome)
                    ),
                    None => format!(
                        "Received response '{}' for an unknown request.\n{}",
                        id,
                        outcome(&response.outcome)
                    ),
                }
            }
        };
        self.write(&entry);
    }

    fn write(&self, entry: &str) {
        let timestamp = Local::now().format("%-I:%M:%S %p");
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let result = write!(out, "[Trace - {}] {}\n\n", timestamp, entry).and_then(|()| out.flush());
        if let Err(e) = result {
            log::warn!("Failed to write message trace: {}", e);
        }
    }
}

impl std::fmt::Debug for MessageTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTracer").finish_non_exhaustive()
    }
}

fn remember(table: &Mutex<HashMap<MessageId, Started>>, id: &MessageId, method: &str) {
    table.lock().unwrap_or_else(|e| e.into_inner()).insert(
        id.clone(),
        Started {
            method: method.to_string(),
            at: Instant::now(),
        },
    );
}

fn take(table: &Mutex<HashMap<MessageId, Started>>, id: &MessageId) -> Option<Started> {
    table.lock().unwrap_or_else(|e| e.into_inner()).remove(id)
}

/// A cancelled request may never see a response.
fn forget_cancelled(table: &Mutex<HashMap<MessageId, Started>>, notification: &NotificationMessage) {
    if notification.method != CANCEL_METHOD {
        return;
    }
    if let Ok(CancelParams { id }) = notification.params.decode::<CancelParams>() {
        take(table, &id);
    }
}

fn section(label: &str, payload: &Payload) -> String {
    match payload.to_json() {
        Ok(Some(value)) => {
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            format!("{}: {}\n", label, pretty)
        }
        Ok(None) => "No parameters provided.\n".to_string(),
        Err(e) => format!("{}: <unserializable: {}>\n", label, e),
    }
}

fn outcome(outcome: &ResponseOutcome) -> String {
    match outcome {
        ResponseOutcome::Result(result) => match result.to_json() {
            Ok(Some(_)) => section("Result", result),
            _ => "No response returned.\n".to_string(),
        },
        ResponseOutcome::Error(error) => {
            let value = serde_json::to_value(error).unwrap_or_default();
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| error.to_string());
            format!("Error: {}\n", pretty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::types::{NotificationMessage, RequestMessage, ResponseError, ResponseMessage};
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_request_and_response_trace() {
        let buffer = SharedBuffer::default();
        let tracer = MessageTracer::new(buffer.clone());

        tracer.on_sent(&RequestMessage::new("1", "initialize", Payload::json(json!({"clientID": "x"}))).into());
        tracer.on_received(&ResponseMessage::success(MessageId::from("1"), Payload::json(json!({"ok": true}))).into());

        let text = buffer.text();
        assert!(text.starts_with("[Trace - "), "{}", text);
        assert!(text.contains("Sending request 'initialize - (1)'.\nParams: {\n  \"clientID\": \"x\"\n}"));
        assert!(text.contains("Received response 'initialize - (1)' in "));
        assert!(text.contains("Result: {\n  \"ok\": true\n}"));
    }

    #[test]
    fn test_incoming_request_and_error_response() {
        let buffer = SharedBuffer::default();
        let tracer = MessageTracer::new(buffer.clone());

        tracer.on_received(&RequestMessage::new(4, "shutdown", Payload::None).into());
        tracer.on_sent(&ResponseMessage::error(Some(MessageId::from(4)), ResponseError::custom(-1, "no", None)).into());
        tracer.on_received(&NotificationMessage::new("exit", Payload::None).into());

        let text = buffer.text();
        assert!(text.contains("Received request 'shutdown - (4)'.\nNo parameters provided."));
        assert!(text.contains("Sending response 'shutdown - (4)'. Processing request took "));
        assert!(text.contains("\"message\": \"no\""));
        assert!(text.contains("Received notification 'exit'."));
    }

    #[test]
    fn test_cancelled_requests_are_forgotten() {
        let tracer = MessageTracer::new(SharedBuffer::default());

        tracer.on_sent(&RequestMessage::new("1", "slow", Payload::None).into());
        tracer.on_sent(&RequestMessage::new("2", "slow", Payload::None).into());
        tracer.on_sent(
            &NotificationMessage::new(CANCEL_METHOD, Payload::typed(CancelParams { id: MessageId::from("1") })).into(),
        );
        assert_eq!(tracer.sent_requests.lock().unwrap().len(), 1);
        assert!(tracer.sent_requests.lock().unwrap().contains_key(&MessageId::from("2")));

        tracer.on_received(&RequestMessage::new(7, "wait", Payload::None).into());
        tracer.on_received(&NotificationMessage::new(CANCEL_METHOD, Payload::json(json!({"id": 7}))).into());
        assert!(tracer.received_requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_response() {
        let buffer = SharedBuffer::default();
        let tracer = MessageTracer::new(buffer.clone());
        tracer.on_received(&ResponseMessage::success(MessageId::from(99), Payload::None).into());
        assert!(buffer.text().contains("Received response '99' for an unknown request.\nNo response returned."));
    }
}
