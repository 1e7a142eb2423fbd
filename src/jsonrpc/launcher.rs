//! Wiring a connection together.
//!
//! ```rust,no_run
//! use duplex_rpc::jsonrpc::{Launcher, LocalService, ServiceGroup, HandlerError};
//! use serde_json::Value;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let service = LocalService::new("server")
//!     .on_request("ping", |_: Value, _token| async move { Ok::<_, HandlerError>("pong".to_string()) });
//! let launcher = Launcher::builder()
//!     .local_service(service)
//!     .remote_interface(ServiceGroup::new("client").notification::<Value>("log"))
//!     .build(tokio::io::stdin(), tokio::io::stdout())?;
//! let remote = launcher.remote_endpoint();
//! let connection = launcher.start_listening();
//! remote.notify("log", duplex_rpc::jsonrpc::Payload::None)?;
//! connection.session.join().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{Dialect, MessageCodec};
use super::endpoint::RemoteEndpoint;
use super::handler::{DefaultErrorTranslator, Endpoint, ErrorTranslator, LocalService};
use super::registry::{MethodRegistry, RegistryError, ServiceGroup};
use super::session::{self, SessionHandle, SessionOptions};
use super::trace::MessageTracer;
use super::transport::{self, FrameReader, FrameWriter, TransportError, DEFAULT_MAX_FRAME_LEN};
use super::types::Message;
use crate::config::EndpointConfig;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid service interface: {0}")]
    Registry(#[from] RegistryError),
}

type LivenessFn = Arc<dyn Fn() -> bool + Send + Sync>;

struct LocalSide {
    handler: Arc<dyn Endpoint>,
    groups: Vec<ServiceGroup>,
    exposed: String,
}

pub struct LauncherBuilder {
    config: EndpointConfig,
    local: Option<LocalSide>,
    catalog: Vec<ServiceGroup>,
    remote: Vec<String>,
    translator: Arc<dyn ErrorTranslator>,
    tracer: Option<Arc<MessageTracer>>,
    liveness: Option<(Duration, LivenessFn)>,
    max_frame_len: usize,
}

impl Default for LauncherBuilder {
    fn default() -> Self {
        Self {
            config: EndpointConfig::default(),
            local: None,
            catalog: Vec::new(),
            remote: Vec::new(),
            translator: Arc::new(DefaultErrorTranslator),
            tracer: None,
            liveness: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl LauncherBuilder {
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.config.dialect = dialect;
        self
    }

    /// Serve `service` and every service it delegates to
    pub fn local_service(mut self, service: LocalService) -> Self {
        self.local = Some(LocalSide {
            groups: service.groups(),
            exposed: service.name().to_string(),
            handler: Arc::new(service),
        });
        self
    }

    /// Serve a hand-written endpoint whose methods are described by `group`
    pub fn local_endpoint(mut self, handler: Arc<dyn Endpoint>, group: ServiceGroup) -> Self {
        self.local = Some(LocalSide {
            exposed: group.name().to_string(),
            groups: vec![group],
            handler,
        });
        self
    }

    /// Methods the remote side serves. May be called more than once.
    pub fn remote_interface(mut self, group: ServiceGroup) -> Self {
        self.remote.push(group.name().to_string());
        self.catalog.push(group);
        self
    }

    /// A group only referenced through delegation
    pub fn group(mut self, group: ServiceGroup) -> Self {
        self.catalog.push(group);
        self
    }

    pub fn error_translator(mut self, translator: impl ErrorTranslator + 'static) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn trace_to<W: std::io::Write + Send + 'static>(mut self, writer: W) -> Self {
        self.tracer = Some(Arc::new(MessageTracer::new(writer)));
        self
    }

    /// Poll `check` every `interval`; the session is stopped the first time it returns false.
    pub fn liveness_check<F>(mut self, interval: Duration, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.liveness = Some((interval, Arc::new(check)));
        self
    }

    /// Largest inbound frame body; a longer frame ends the session.
    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn build<R, W>(self, reader: R, writer: W) -> Result<Launcher<R, W>, LaunchError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let local = match self.local {
            Some(local) => local,
            None => {
                let service = LocalService::new("local");
                LocalSide {
                    groups: service.groups(),
                    exposed: service.name().to_string(),
                    handler: Arc::new(service),
                }
            }
        };

        let registry = self
            .remote
            .iter()
            .fold(
                MethodRegistry::builder()
                    .groups(local.groups)
                    .groups(self.catalog)
                    .local(local.exposed),
                |builder, name| builder.remote(name.clone()),
            )
            .build()?;
        log::debug!(
            "Built {:?} launcher with {} methods",
            self.config.dialect,
            registry.len()
        );

        let codec = self.config.dialect.codec(Arc::new(registry));
        let (consumer, outgoing) = transport::channel();
        let endpoint = RemoteEndpoint::with_error_translator(
            codec.clone(),
            local.handler,
            Arc::new(consumer),
            self.translator,
        );
        let tracer = match self.tracer {
            Some(tracer) => Some(tracer),
            None if self.config.trace_messages => Some(Arc::new(MessageTracer::stderr())),
            None => None,
        };

        Ok(Launcher {
            codec,
            endpoint,
            outgoing,
            reader,
            writer,
            options: SessionOptions {
                tracer,
                abandon_pending_on_close: self.config.abandon_pending_on_close,
            },
            liveness: self.liveness,
            max_frame_len: self.max_frame_len,
        })
    }
}

/// A configured connection that has not started reading yet
pub struct Launcher<R, W> {
    codec: Arc<dyn MessageCodec>,
    endpoint: RemoteEndpoint,
    outgoing: mpsc::UnboundedReceiver<Message>,
    reader: R,
    writer: W,
    options: SessionOptions,
    liveness: Option<(Duration, LivenessFn)>,
    max_frame_len: usize,
}

/// Tasks of a running connection
#[derive(Debug)]
pub struct Connection {
    pub session: SessionHandle,
    /// Ends once every handle to the remote endpoint is dropped
    pub writer: JoinHandle<Result<(), TransportError>>,
}

impl Launcher<(), ()> {
    pub fn builder() -> LauncherBuilder {
        LauncherBuilder::default()
    }
}

impl<R, W> Launcher<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn remote_endpoint(&self) -> RemoteEndpoint {
        self.endpoint.clone()
    }

    pub fn codec(&self) -> Arc<dyn MessageCodec> {
        self.codec.clone()
    }

    /// Spawn the writer task and the session driver.
    pub fn start_listening(self) -> Connection {
        let writer = tokio::spawn(transport::write_loop(
            self.outgoing,
            self.codec.clone(),
            FrameWriter::new(self.writer),
            self.options.tracer.clone(),
        ));
        let session = session::start(
            FrameReader::new(self.reader).with_max_frame_len(self.max_frame_len),
            self.codec,
            self.endpoint,
            self.options,
        );
        if let Some((interval, check)) = self.liveness {
            tokio::spawn(watch_liveness(interval, check, session.cancellation_token()));
        }
        Connection { session, writer }
    }
}

async fn watch_liveness(period: Duration, check: LivenessFn, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // 初回tickは即座に完了するので読み捨てる
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if !check() {
                    log::warn!("Liveness check failed, stopping session");
                    token.cancel();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::handler::HandlerError;
    use crate::jsonrpc::session::SessionEnd;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn service() -> LocalService {
        LocalService::new("server").on_request("ping", |_: Value, _token| async move {
            Ok::<_, HandlerError>("pong".to_string())
        })
    }

    #[test]
    fn test_duplicate_methods_fail_to_build() {
        let (a, b) = tokio::io::duplex(64);
        let result = Launcher::builder()
            .local_service(service())
            .remote_interface(ServiceGroup::new("client").request::<Value, Value>("ping"))
            .build(a, b);
        assert!(matches!(
            result,
            Err(LaunchError::Registry(RegistryError::DuplicateMethod { .. }))
        ));
    }

    #[test]
    fn test_unknown_delegate_fails_to_build() {
        let (a, b) = tokio::io::duplex(64);
        let result = Launcher::builder()
            .remote_interface(ServiceGroup::new("client").delegate("missing"))
            .build(a, b);
        assert!(matches!(result, Err(LaunchError::Registry(RegistryError::UnknownGroup(_)))));
    }

    #[tokio::test]
    async fn test_config_selects_dialect() {
        let (a, b) = tokio::io::duplex(64);
        let config = EndpointConfig {
            dialect: Dialect::Debug,
            ..EndpointConfig::default()
        };
        let launcher = Launcher::builder().config(config).local_service(service()).build(a, b).unwrap();
        assert_eq!(launcher.codec().dialect(), Dialect::Debug);
        assert!(launcher.codec().registry().contains("ping"));
    }

    #[tokio::test]
    async fn test_frame_limit_applies_to_session() {
        use crate::jsonrpc::session::SessionError;
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let launcher = Launcher::builder()
            .local_service(service())
            .max_frame_len(16)
            .build(reader, writer)
            .unwrap();
        let connection = launcher.start_listening();

        remote.write_all(b"Content-Length: 100\r\n\r\n").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), connection.session.join())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::FrameTooLarge { length: 100, max: 16 }))
        ));
    }

    #[tokio::test]
    async fn test_failed_liveness_check_stops_session() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local);
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();
        let launcher = Launcher::builder()
            .local_service(service())
            .liveness_check(Duration::from_millis(10), move || flag.load(Ordering::SeqCst))
            .build(reader, writer)
            .unwrap();
        let connection = launcher.start_listening();

        alive.store(false, Ordering::SeqCst);
        let end = tokio::time::timeout(Duration::from_secs(5), connection.session.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
    }
}
