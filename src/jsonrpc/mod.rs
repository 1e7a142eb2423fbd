//! Bidirectional JSON-RPC engine
//!
//! Both sides of a connection are peers: each one serves requests and sends
//! its own. The same engine speaks two wire dialects, plain JSON-RPC 2.0 and
//! the debug adapter envelope.
//!
//! ## 主要コンポーネント
//!
//! - [`types`]: message model and error codes
//! - [`payload`] / [`either`]: typed payloads and union values
//! - [`registry`]: method catalog built from service groups
//! - [`codec`]: buffer-then-resolve decoding for both dialects
//! - [`endpoint`]: the per-connection dispatcher
//! - [`future`]: cancellable request futures
//! - [`session`] / [`transport`]: the read loop and Content-Length framing
//! - [`launcher`]: wires everything to a byte stream pair

pub mod codec;
pub mod either;
pub mod endpoint;
pub mod future;
pub mod handler;
pub mod launcher;
pub mod payload;
pub mod registry;
pub mod session;
pub mod trace;
pub mod transport;
pub mod types;

pub use codec::{Dialect, MessageCodec, MessageIssue, MethodProvider};
pub use either::{Either, Either3};
pub use endpoint::RemoteEndpoint;
pub use future::{CancelHandle, CancellationRoot, RequestError, RequestFuture};
pub use handler::{DefaultErrorTranslator, Endpoint, ErrorTranslator, HandlerError, LocalService};
pub use launcher::{Connection, LaunchError, Launcher, LauncherBuilder};
pub use payload::{AnyPayload, Payload};
pub use registry::{MethodDescriptor, MethodRegistry, RegistryError, ServiceGroup, Shape};
pub use session::{SessionEnd, SessionError, SessionHandle, SessionOptions};
pub use trace::MessageTracer;
pub use transport::{FrameReader, FrameSource, FrameWriter, MessageConsumer, TransportError};
pub use types::{
    ErrorCode, Message, MessageId, NotificationMessage, RequestMessage, ResponseError, ResponseMessage,
    ResponseOutcome,
};
