//! Local service surface.
//!
//! The dispatcher hands every incoming request and notification to an
//! [`Endpoint`]. [`LocalService`] is the usual implementation: typed closures
//! registered per method, which also describe the matching [`ServiceGroup`]
//! so the codec can resolve their parameter types.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::payload::{AnyPayload, Payload};
use super::registry::{MethodDescriptor, ServiceGroup};
use super::types::{ErrorCode, ResponseError};

/// Failure of a local handler
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Response(#[from] ResponseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Receiver of incoming requests and notifications
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Handle a request. `token` is cancelled when the remote cancels the request.
    async fn handle_request(
        &self,
        method: &str,
        params: Payload,
        token: CancellationToken,
    ) -> Result<Payload, HandlerError>;

    async fn handle_notification(&self, method: &str, params: Payload) -> Result<(), HandlerError>;
}

/// Turns a handler failure into the error sent back to the caller
pub trait ErrorTranslator: Send + Sync {
    fn translate(&self, method: &str, error: &HandlerError) -> ResponseError;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorTranslator;

impl ErrorTranslator for DefaultErrorTranslator {
    fn translate(&self, method: &str, error: &HandlerError) -> ResponseError {
        match error {
            HandlerError::MethodNotFound(name) => {
                ResponseError::new(ErrorCode::MethodNotFound, format!("Unsupported request method: {}", name))
            }
            HandlerError::InvalidParams(message) => ResponseError::new(ErrorCode::InvalidParams, message.clone()),
            HandlerError::Cancelled => ResponseError::from_code(ErrorCode::RequestCancelled),
            HandlerError::Response(error) => error.clone(),
            HandlerError::Other(error) => {
                log::error!("Internal error while handling '{}': {:#}", method, error);
                ResponseError::new(ErrorCode::InternalError, error.to_string())
            }
        }
    }
}

impl<F> ErrorTranslator for F
where
    F: Fn(&str, &HandlerError) -> ResponseError + Send + Sync,
{
    fn translate(&self, method: &str, error: &HandlerError) -> ResponseError {
        self(method, error)
    }
}

type RequestFn = Box<dyn Fn(Payload, CancellationToken) -> BoxFuture<'static, Result<Payload, HandlerError>> + Send + Sync>;
type NotificationFn = Box<dyn Fn(Payload) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Typed closures bound to a [`ServiceGroup`]
pub struct LocalService {
    group: ServiceGroup,
    requests: HashMap<String, RequestFn>,
    notifications: HashMap<String, NotificationFn>,
    delegates: Vec<LocalService>,
}

impl LocalService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group: ServiceGroup::new(name),
            requests: HashMap::new(),
            notifications: HashMap::new(),
            delegates: Vec::new(),
        }
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.group = self.group.segment(segment);
        self
    }

    pub fn on_request<P, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + AnyPayload + Clone,
        R: DeserializeOwned + AnyPayload,
        F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let method = method.into();
        self.group.push_method(MethodDescriptor::request::<P, R>(method.clone()));
        let wrapped: RequestFn = Box::new(move |params: Payload, token: CancellationToken| {
            match params.decode::<P>() {
                Ok(params) => {
                    let future = handler(params, token);
                    async move { future.await.map(Payload::typed) }.boxed()
                }
                Err(e) => futures_util::future::ready(Err(HandlerError::InvalidParams(e.to_string()))).boxed(),
            }
        });
        self.requests.insert(method, wrapped);
        self
    }

    pub fn on_notification<P, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + AnyPayload + Clone,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let method = method.into();
        self.group.push_method(MethodDescriptor::notification::<P>(method.clone()));
        let wrapped: NotificationFn = Box::new(move |params: Payload| match params.decode::<P>() {
            Ok(params) => handler(params).boxed(),
            Err(e) => futures_util::future::ready(Err(HandlerError::InvalidParams(e.to_string()))).boxed(),
        });
        self.notifications.insert(method, wrapped);
        self
    }

    /// Serve another service's methods under its own segment
    pub fn delegate(mut self, service: LocalService) -> Self {
        self.group.push_delegate(service.name().to_string());
        self.delegates.push(service);
        self
    }

    pub fn name(&self) -> &str {
        self.group.name()
    }

    pub fn group(&self) -> &ServiceGroup {
        &self.group
    }

    /// This group followed by every delegated group
    pub fn groups(&self) -> Vec<ServiceGroup> {
        let mut groups = vec![self.group.clone()];
        for delegate in &self.delegates {
            groups.extend(delegate.groups());
        }
        groups
    }

    fn find_request(&self, method: &str) -> Option<&RequestFn> {
        method
            .strip_prefix(self.group.segment_prefix())
            .and_then(|name| self.requests.get(name))
            .or_else(|| self.delegates.iter().find_map(|d| d.find_request(method)))
    }

    fn find_notification(&self, method: &str) -> Option<&NotificationFn> {
        method
            .strip_prefix(self.group.segment_prefix())
            .and_then(|name| self.notifications.get(name))
            .or_else(|| self.delegates.iter().find_map(|d| d.find_notification(method)))
    }
}

impl std::fmt::Debug for LocalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalService")
            .field("group", &self.group)
            .field("delegates", &self.delegates)
            .finish()
    }
}

#[async_trait]
impl Endpoint for LocalService {
    async fn handle_request(
        &self,
        method: &str,
        params: Payload,
        token: CancellationToken,
    ) -> Result<Payload, HandlerError> {
        match self.find_request(method) {
            Some(handler) => handler(params, token).await,
            None => Err(HandlerError::MethodNotFound(method.to_string())),
        }
    }

    async fn handle_notification(&self, method: &str, params: Payload) -> Result<(), HandlerError> {
        match self.find_notification(method) {
            Some(handler) => handler(params).await,
            None => Err(HandlerError::MethodNotFound(method.to_string())),
        }
    }
}

#[async_trait]
impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    async fn handle_request(
        &self,
        method: &str,
        params: Payload,
        token: CancellationToken,
    ) -> Result<Payload, HandlerError> {
        (**self).handle_request(method, params, token).await
    }

    async fn handle_notification(&self, method: &str, params: Payload) -> Result<(), HandlerError> {
        (**self).handle_notification(method, params).await
    }
}
