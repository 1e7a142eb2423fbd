//! Cancellable request results.
//!
//! Every outbound request owns one [`CancellationRoot`]: the one-shot wire
//! action (`$/cancelRequest`) plus the root's cancellation token. The
//! [`RequestFuture`] returned by the dispatcher is the root node; combinators
//! such as [`RequestFuture::map`] produce derived nodes that share the root and
//! own a child token of it. However many nodes are cancelled, the wire action
//! runs at most once, and never after the response has arrived.

use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::payload::Payload;
use super::types::ResponseError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type CancelAction = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

/// Why a request did not produce a value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("remote returned an error: {0}")]
    Response(ResponseError),

    #[error("request was cancelled")]
    Cancelled,

    #[error("connection closed before a response arrived")]
    ChannelClosed,

    #[error("request timed out")]
    Timeout,

    #[error("failed to decode result: {0}")]
    Decode(String),
}

/// State shared by a request future and everything derived from it
pub struct CancellationRoot {
    sent: AtomicBool,
    completed: AtomicBool,
    action: Mutex<Option<CancelAction>>,
    token: CancellationToken,
}

impl CancellationRoot {
    pub fn new<F>(action: F) -> Arc<Self>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        Arc::new(Self {
            sent: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
            token: CancellationToken::new(),
        })
    }

    /// Root without a wire action
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            sent: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            action: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }

    /// Run the wire action unless it already ran or the request completed.
    ///
    /// Returns `true` for the call that actually claimed the send.
    pub fn send_cancel(&self) -> bool {
        if self.completed.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let action = self.action.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(action) = action {
            match std::panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Failed to send cancellation: {}", e),
                Err(_) => log::error!("Cancellation action panicked"),
            }
        }
        true
    }

    /// Send the wire cancellation and resolve the root future to `Cancelled`.
    pub fn cancel(&self) {
        self.send_cancel();
        self.token.cancel();
    }

    /// The response arrived; later cancellations stay local.
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.action.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_cancel_sent(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for CancellationRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRoot")
            .field("sent", &self.is_cancel_sent())
            .field("completed", &self.is_completed())
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Cancels one node of a request future from elsewhere
#[derive(Debug, Clone)]
pub struct CancelHandle {
    root: Arc<CancellationRoot>,
    token: CancellationToken,
    is_root: bool,
}

impl CancelHandle {
    pub fn cancel(&self) {
        cancel_node(&self.root, &self.token, self.is_root);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn cancel_node(root: &CancellationRoot, token: &CancellationToken, is_root: bool) {
    if is_root {
        root.cancel();
    } else {
        token.cancel();
        root.send_cancel();
    }
}

/// Result of an outbound request.
///
/// Dropping the future does not cancel the request; call [`cancel`](Self::cancel).
pub struct RequestFuture<T> {
    inner: BoxFuture<'static, Result<T, RequestError>>,
    root: Arc<CancellationRoot>,
    token: CancellationToken,
    is_root: bool,
}

impl RequestFuture<Payload> {
    /// Root future completed through `rx` by the dispatcher.
    pub fn from_receiver(
        root: Arc<CancellationRoot>,
        rx: oneshot::Receiver<Result<Payload, ResponseError>>,
    ) -> Self {
        let token = root.token().clone();
        let cancelled = token.clone();
        let inner = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(RequestError::Cancelled),
                outcome = rx => match outcome {
                    Ok(Ok(payload)) => Ok(payload),
                    Ok(Err(error)) => Err(RequestError::Response(error)),
                    Err(_) => Err(RequestError::ChannelClosed),
                },
            }
        }
        .boxed();

        Self {
            inner,
            root,
            token,
            is_root: true,
        }
    }
}

impl<T: Send + 'static> RequestFuture<T> {
    /// Future that has already failed
    pub fn failed(error: RequestError) -> Self {
        let root = CancellationRoot::detached();
        root.mark_completed();
        let token = root.token().clone();
        Self {
            inner: futures_util::future::ready(Err(error)).boxed(),
            root,
            token,
            is_root: true,
        }
    }

    /// Derived node whose output is produced by `build` from this node's output.
    fn derive<U, F, Fut>(self, build: F) -> RequestFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, RequestError>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        let node = self.token.child_token();
        let cancelled = node.clone();
        let upstream = self.inner;
        let inner = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(RequestError::Cancelled),
                output = async move { build(upstream.await).await } => output,
            }
        }
        .boxed();

        RequestFuture {
            inner,
            root: self.root,
            token: node,
            is_root: false,
        }
    }

    pub fn map<U, F>(self, f: F) -> RequestFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.derive(|output| async move { output.map(f) })
    }

    pub fn try_map<U, F>(self, f: F) -> RequestFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, RequestError> + Send + 'static,
    {
        self.derive(|output| async move { output.and_then(f) })
    }

    pub fn and_then<U, F, Fut>(self, f: F) -> RequestFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, RequestError>> + Send + 'static,
    {
        self.derive(|output| async move {
            match output {
                Ok(value) => f(value).await,
                Err(e) => Err(e),
            }
        })
    }

    /// Give up after `duration`; expiry cancels this node and the request.
    pub fn with_timeout(self, duration: Duration) -> RequestFuture<T> {
        let root = self.root.clone();
        let node = self.token.child_token();
        let cancelled = node.clone();
        let expired = node.clone();
        let upstream = self.inner;
        let inner = async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(RequestError::Cancelled),
                output = tokio::time::timeout(duration, upstream) => match output {
                    Ok(output) => output,
                    Err(_) => {
                        log::debug!("Request timed out after {:?}", duration);
                        cancel_node(&root, &expired, false);
                        Err(RequestError::Timeout)
                    }
                },
            }
        }
        .boxed();

        RequestFuture {
            inner,
            root: self.root,
            token: node,
            is_root: false,
        }
    }
}

impl<T> RequestFuture<T> {
    /// Cancel this node. On the root this also resolves every derived node.
    pub fn cancel(&self) {
        cancel_node(&self.root, &self.token, self.is_root);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            root: self.root.clone(),
            token: self.token.clone(),
            is_root: self.is_root,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn root(&self) -> &Arc<CancellationRoot> {
        &self.root
    }
}

impl<T> Future for RequestFuture<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for RequestFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("root", &self.root)
            .field("is_root", &self.is_root)
            .finish()
    }
}
