//! Session driver: the task pumping inbound frames into the dispatcher.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::MessageCodec;
use super::endpoint::RemoteEndpoint;
use super::trace::MessageTracer;
use super::transport::{FrameSource, TransportError};

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport failed: {0}")]
    Transport(#[source] TransportError),

    #[error("session task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub tracer: Option<Arc<MessageTracer>>,
    /// Resolve outstanding requests with `ChannelClosed` once the session ends
    pub abandon_pending_on_close: bool,
}

/// Handle to a running session
#[derive(Debug)]
pub struct SessionHandle {
    token: CancellationToken,
    task: JoinHandle<Result<SessionEnd, SessionError>>,
}

impl SessionHandle {
    /// Stop reading. Local calls already running are not interrupted.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<SessionEnd, SessionError> {
        self.task.await?
    }
}

/// Spawn the session task.
pub fn start<S>(
    source: S,
    codec: Arc<dyn MessageCodec>,
    endpoint: RemoteEndpoint,
    options: SessionOptions,
) -> SessionHandle
where
    S: FrameSource + 'static,
{
    let token = CancellationToken::new();
    let task = tokio::spawn(run(source, codec, endpoint, options, token.clone()));
    SessionHandle { token, task }
}

async fn run<S: FrameSource>(
    mut source: S,
    codec: Arc<dyn MessageCodec>,
    endpoint: RemoteEndpoint,
    options: SessionOptions,
    token: CancellationToken,
) -> Result<SessionEnd, SessionError> {
    log::debug!("Session started ({:?} dialect)", codec.dialect());

    let result = loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(SessionEnd::Cancelled),
            frame = source.next_frame() => frame,
        };

        match frame {
            Ok(Some(text)) => {
                log::trace!("Received: {}", text);
                match codec.decode_str(&text, &endpoint) {
                    Ok(message) => {
                        if let Some(tracer) = &options.tracer {
                            tracer.on_received(&message);
                        }
                        endpoint.consume(message).await;
                    }
                    Err(issue) => endpoint.handle_issue(issue),
                }
            }
            Ok(None) => break Ok(SessionEnd::EndOfStream),
            Err(e) if e.is_fatal() => break Err(SessionError::Transport(e)),
            Err(e) => log::warn!("Skipping unreadable frame: {}", e),
        }
    };

    match &result {
        Ok(end) => log::debug!("Session ended: {:?}", end),
        Err(e) => log::error!("Session failed: {}", e),
    }
    if options.abandon_pending_on_close {
        endpoint.abandon_pending();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::codec::Dialect;
    use crate::jsonrpc::future::RequestError;
    use crate::jsonrpc::handler::{HandlerError, LocalService};
    use crate::jsonrpc::payload::Payload;
    use crate::jsonrpc::registry::{MethodRegistry, ServiceGroup};
    use crate::jsonrpc::transport::{channel, FrameReader};
    use crate::jsonrpc::types::{ErrorCode, Message, ResponseOutcome};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn endpoint(dialect: Dialect) -> (RemoteEndpoint, Arc<dyn MessageCodec>, mpsc::UnboundedReceiver<Message>) {
        let service = LocalService::new("local").on_request("ping", |_: Value, _token| async move {
            Ok::<_, HandlerError>("pong".to_string())
        });
        let registry = MethodRegistry::builder()
            .groups(service.groups())
            .group(ServiceGroup::new("remote").request::<Value, Value>("status"))
            .local("local")
            .remote("remote")
            .build()
            .unwrap();
        let codec = dialect.codec(Arc::new(registry));
        let (consumer, receiver) = channel();
        let endpoint = RemoteEndpoint::new(codec.clone(), Arc::new(service), Arc::new(consumer));
        (endpoint, codec, receiver)
    }

    #[tokio::test]
    async fn test_pumps_frames_until_end_of_stream() {
        let (endpoint, codec, mut outgoing) = endpoint(Dialect::Base);
        let (frames, source) = mpsc::unbounded_channel::<String>();
        let session = start(source, codec, endpoint, SessionOptions::default());

        frames
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .unwrap();
        let Message::Response(response) = outgoing.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(
            response.outcome,
            ResponseOutcome::Result(Payload::typed("pong".to_string()))
        );

        drop(frames);
        assert_eq!(session.join().await.unwrap(), SessionEnd::EndOfStream);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_answered_and_session_continues() {
        let (endpoint, codec, mut outgoing) = endpoint(Dialect::Debug);
        let (frames, source) = mpsc::unbounded_channel::<String>();
        let session = start(source, codec, endpoint, SessionOptions::default());

        frames
            .send(r#"{"type":"request","seq":2,"command":"foo""#.to_string())
            .unwrap();
        let Message::Response(response) = outgoing.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.id, Some(2.into()));
        assert_eq!(response.method.as_deref(), Some("foo"));
        let ResponseOutcome::Error(error) = response.outcome else {
            panic!("expected error");
        };
        assert_eq!(error.error_code(), Some(ErrorCode::ParseError));

        frames
            .send(r#"{"seq":3,"type":"request","command":"ping"}"#.to_string())
            .unwrap();
        let Message::Response(response) = outgoing.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert!(response.is_success());

        session.cancel();
        assert_eq!(session.join().await.unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_fatal_transport_error_ends_session() {
        let (endpoint, codec, _outgoing) = endpoint(Dialect::Base);
        let reader = FrameReader::new("Content-Length: 40\r\n\r\n{\"jsonrpc\"".as_bytes());
        let session = start(reader, codec, endpoint, SessionOptions::default());
        assert!(matches!(session.join().await, Err(SessionError::Transport(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_session_with_error() {
        let (endpoint, codec, _outgoing) = endpoint(Dialect::Base);
        let reader = FrameReader::new("Content-Length: 18446744073709551615\r\n\r\n{}".as_bytes());
        let session = start(reader, codec, endpoint, SessionOptions::default());
        assert!(matches!(
            session.join().await,
            Err(SessionError::Transport(TransportError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn test_abandon_pending_on_close() {
        let (endpoint, codec, _outgoing) = endpoint(Dialect::Base);
        let future = endpoint.request("status", Payload::None);
        let (frames, source) = mpsc::unbounded_channel::<String>();
        let options = SessionOptions {
            abandon_pending_on_close: true,
            ..SessionOptions::default()
        };
        let session = start(source, codec, endpoint.clone(), options);

        drop(frames);
        session.join().await.unwrap();
        assert_eq!(endpoint.pending_count(), 0);
        assert_eq!(future.await, Err(RequestError::ChannelClosed));
    }
}
