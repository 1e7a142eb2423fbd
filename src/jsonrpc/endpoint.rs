//! Per-connection dispatcher.
//!
//! [`RemoteEndpoint`] is both halves of a connection: it sends requests and
//! notifications to the remote side and correlates the responses, and it
//! routes incoming messages to the local [`Endpoint`], writing back one
//! response per request.

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::codec::{MessageCodec, MessageIssue, MethodProvider};
use super::future::{CancellationRoot, RequestError, RequestFuture};
use super::handler::{DefaultErrorTranslator, Endpoint, ErrorTranslator, HandlerError};
use super::payload::{AnyPayload, Payload};
use super::transport::{MessageConsumer, TransportError};
use super::types::{
    CancelParams, ErrorCode, Message, MessageId, NotificationMessage, RequestMessage, ResponseError,
    ResponseMessage, ResponseOutcome, CANCEL_METHOD,
};

struct PendingRequest {
    method: String,
    root: Arc<CancellationRoot>,
    sender: oneshot::Sender<Result<Payload, ResponseError>>,
}

struct EndpointInner {
    codec: Arc<dyn MessageCodec>,
    handler: Arc<dyn Endpoint>,
    out: Arc<dyn MessageConsumer>,
    translator: Arc<dyn ErrorTranslator>,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    in_flight: Mutex<HashMap<MessageId, CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EndpointInner {
    fn send(&self, message: Message) {
        if let Err(e) = self.out.consume(message) {
            log::warn!("Failed to send message: {}", e);
        }
    }

    fn send_cancel(&self, id: &MessageId) -> Result<(), TransportError> {
        lock(&self.pending).remove(id);
        log::debug!("Cancelling request {}", id);
        let params = Payload::typed(CancelParams { id: id.clone() });
        self.out.consume(NotificationMessage::new(CANCEL_METHOD, params).into())
    }
}

/// Dispatcher for one connection; cheap to clone
#[derive(Clone)]
pub struct RemoteEndpoint {
    inner: Arc<EndpointInner>,
}

impl RemoteEndpoint {
    pub fn new(codec: Arc<dyn MessageCodec>, handler: Arc<dyn Endpoint>, out: Arc<dyn MessageConsumer>) -> Self {
        Self::with_error_translator(codec, handler, out, Arc::new(DefaultErrorTranslator))
    }

    pub fn with_error_translator(
        codec: Arc<dyn MessageCodec>,
        handler: Arc<dyn Endpoint>,
        out: Arc<dyn MessageConsumer>,
        translator: Arc<dyn ErrorTranslator>,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                codec,
                handler,
                out,
                translator,
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn codec(&self) -> &Arc<dyn MessageCodec> {
        &self.inner.codec
    }

    /// Send a request; the returned future resolves with the response payload.
    pub fn request(&self, method: &str, params: Payload) -> RequestFuture<Payload> {
        let id = self.inner.codec.next_request_id();
        let (sender, receiver) = oneshot::channel();

        let weak: Weak<EndpointInner> = Arc::downgrade(&self.inner);
        let cancel_id = id.clone();
        let root = CancellationRoot::new(move || match weak.upgrade() {
            Some(inner) => inner.send_cancel(&cancel_id).map_err(Into::into),
            None => Ok(()),
        });

        lock(&self.inner.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                root: root.clone(),
                sender,
            },
        );

        let message = RequestMessage::new(id.clone(), method, params);
        if let Err(e) = self.inner.out.consume(message.into()) {
            log::warn!("Failed to send request '{}': {}", method, e);
            // 送信失敗時はエントリを戻す（senderのdropでChannelClosedになる）
            lock(&self.inner.pending).remove(&id);
            root.mark_completed();
        }

        RequestFuture::from_receiver(root, receiver)
    }

    /// Typed request: `params` goes out as-is, the result is decoded into `R`.
    pub fn call<P, R>(&self, method: &str, params: P) -> RequestFuture<R>
    where
        P: AnyPayload,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        self.request(method, Payload::typed(params))
            .try_map(|payload| payload.decode::<R>().map_err(|e| RequestError::Decode(e.to_string())))
    }

    pub fn notify(&self, method: &str, params: Payload) -> Result<(), TransportError> {
        self.inner
            .out
            .consume(NotificationMessage::new(method, params).into())
    }

    pub fn send_notification<P: AnyPayload>(&self, method: &str, params: P) -> Result<(), TransportError> {
        self.notify(method, Payload::typed(params))
    }

    /// Route one decoded incoming message.
    ///
    /// Notifications run to completion before this returns, so they are
    /// handled in arrival order. Requests are spawned onto the runtime.
    pub async fn consume(&self, message: Message) {
        match message {
            Message::Notification(notification) => self.handle_notification(notification).await,
            Message::Request(request) => self.handle_request(request),
            Message::Response(response) => self.handle_response(response),
        }
    }

    /// Answer a message that could not be decoded, when it can be answered.
    pub fn handle_issue(&self, issue: MessageIssue) {
        match (issue.id(), issue.method()) {
            (Some(id), Some(method)) => {
                log::warn!("Rejecting request {} '{}': {}", id, method, issue);
                let response =
                    ResponseMessage::error(Some(id.clone()), issue.to_response_error()).with_method(method);
                self.inner.send(response.into());
            }
            _ => log::error!("Dropping malformed message: {}", issue),
        }
    }

    async fn handle_notification(&self, notification: NotificationMessage) {
        let NotificationMessage { method, params } = notification;

        if method == CANCEL_METHOD {
            match params.decode::<CancelParams>() {
                Ok(CancelParams { id }) => self.cancel_in_flight(&id),
                Err(e) => log::warn!("Ignoring malformed cancellation: {}", e),
            }
            return;
        }

        if !self.inner.codec.registry().contains(&method) {
            if method.starts_with("$/") {
                log::debug!("Ignoring optional notification '{}'", method);
            } else {
                log::warn!("Unsupported notification method: {}", method);
            }
            return;
        }

        let call = AssertUnwindSafe(self.inner.handler.handle_notification(&method, params));
        match call.catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Notification handler for '{}' failed: {}", method, e),
            Err(panic) => log::error!(
                "Notification handler for '{}' panicked: {}",
                method,
                panic_message(panic.as_ref())
            ),
        }
    }

    fn cancel_in_flight(&self, id: &MessageId) {
        match lock(&self.inner.in_flight).get(id) {
            Some(token) => {
                log::debug!("Remote cancelled request {}", id);
                token.cancel();
            }
            None => log::debug!("Cancellation for unknown or finished request {}", id),
        }
    }

    fn handle_request(&self, request: RequestMessage) {
        let RequestMessage { id, method, params } = request;

        if !self.inner.codec.registry().contains(&method) {
            log::warn!("Unsupported request method: {}", method);
            let error = ResponseError::new(
                ErrorCode::MethodNotFound,
                format!("Unsupported request method: {}", method),
            );
            self.inner
                .send(ResponseMessage::error(Some(id), error).with_method(method).into());
            return;
        }

        let token = CancellationToken::new();
        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.contains_key(&id) {
                drop(in_flight);
                let error = ResponseError::new(
                    ErrorCode::InvalidRequest,
                    format!("Request id {} is already in use", id),
                );
                self.inner
                    .send(ResponseMessage::error(Some(id), error).with_method(method).into());
                return;
            }
            in_flight.insert(id.clone(), token.clone());
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(inner.handler.handle_request(&method, params, token.clone())).catch_unwind() => {
                    Some(result.unwrap_or_else(|panic| {
                        Err(HandlerError::Other(anyhow::anyhow!(
                            "handler panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    }))
                }
            };
            lock(&inner.in_flight).remove(&id);

            let response = match outcome {
                None | Some(Err(HandlerError::Cancelled)) => {
                    log::debug!("Request {} '{}' was cancelled, no response sent", id, method);
                    return;
                }
                Some(Ok(result)) => ResponseMessage::success(id, result),
                Some(Err(e)) => {
                    let error = inner.translator.translate(&method, &e);
                    ResponseMessage::error(Some(id), error)
                }
            };
            inner.send(response.with_method(method).into());
        });
    }

    fn handle_response(&self, response: ResponseMessage) {
        let Some(id) = response.id else {
            match response.outcome {
                ResponseOutcome::Error(error) => log::error!("Remote reported an error without request id: {}", error),
                ResponseOutcome::Result(_) => log::warn!("Ignoring response without id"),
            }
            return;
        };

        let pending = lock(&self.inner.pending).remove(&id);
        let Some(pending) = pending else {
            log::warn!("Unmatched response message: {}", id);
            return;
        };

        pending.root.mark_completed();
        let outcome = match response.outcome {
            ResponseOutcome::Result(result) => Ok(result),
            ResponseOutcome::Error(error) => Err(error),
        };
        if pending.sender.send(outcome).is_err() {
            log::debug!("Caller of '{}' ({}) is no longer waiting", pending.method, id);
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Resolve every outstanding request with `ChannelClosed`.
    pub fn abandon_pending(&self) {
        let drained: Vec<(MessageId, PendingRequest)> = lock(&self.inner.pending).drain().collect();
        if !drained.is_empty() {
            log::debug!("Abandoning {} pending requests", drained.len());
        }
        for (_, pending) in drained {
            pending.root.mark_completed();
        }
    }

    /// Cancel every local call still running.
    pub fn cancel_in_flight_calls(&self) {
        for token in lock(&self.inner.in_flight).values() {
            token.cancel();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl MethodProvider for RemoteEndpoint {
    fn resolve_method(&self, id: &MessageId) -> Option<String> {
        lock(&self.inner.pending).get(id).map(|pending| pending.method.clone())
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("dialect", &self.inner.codec.dialect())
            .field("pending", &self.pending_count())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
