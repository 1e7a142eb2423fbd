//! Content-Length framing over async byte streams.
//!
//! ```text
//! Content-Length: 52\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":"1","method":"initialize"}
//! ```
//!
//! Inbound frames are read by a [`FrameSource`]; outbound messages are pushed
//! into a [`MessageConsumer`] and written by [`write_loop`], the single task
//! that owns the writer.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::codec::{CodecError, MessageCodec};
use super::trace::MessageTracer;
use super::types::{ErrorCode, Message, ResponseError, ResponseMessage};

const CONTENT_LENGTH: &str = "content-length";

/// Largest frame body [`FrameReader`] accepts unless configured otherwise (64 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("message body is not valid UTF-8")]
    InvalidUtf8,

    #[error(transparent)]
    Encode(#[from] CodecError),
}

impl TransportError {
    /// Fatal errors end the session; the rest only lose one frame.
    pub fn is_fatal(&self) -> bool {
        // 過大フレームは本文を読み飛ばせないので復帰不能
        matches!(
            self,
            TransportError::Closed | TransportError::Io(_) | TransportError::FrameTooLarge { .. }
        )
    }
}

/// Sink for outgoing messages
pub trait MessageConsumer: Send + Sync {
    fn consume(&self, message: Message) -> Result<(), TransportError>;
}

/// Consumer feeding the writer task through an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    sender: mpsc::UnboundedSender<Message>,
}

impl MessageConsumer for ChannelConsumer {
    fn consume(&self, message: Message) -> Result<(), TransportError> {
        self.sender.send(message).map_err(|_| TransportError::Closed)
    }
}

pub fn channel() -> (ChannelConsumer, mpsc::UnboundedReceiver<Message>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelConsumer { sender }, receiver)
}

/// Source of raw message texts
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` at a clean end of stream.
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError>;
}

#[async_trait]
impl FrameSource for mpsc::UnboundedReceiver<String> {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.recv().await)
    }
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Refuse frames whose declared body is longer than `max` bytes.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Read the header block. `Ok(None)` when the stream ends before any header.
    async fn read_headers(&mut self) -> Result<Option<Option<usize>>, TransportError> {
        let mut content_length = None;
        let mut seen_header = false;

        loop {
            self.line.clear();
            let bytes_read = self.reader.read_line(&mut self.line).await?;
            if bytes_read == 0 {
                if seen_header {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF inside header block").into());
                }
                log::debug!("EOF reached, no more frames");
                return Ok(None);
            }

            let header_line = self.line.trim();
            if header_line.is_empty() {
                // ヘッダー前の空行は読み飛ばす
                if seen_header {
                    return Ok(Some(content_length));
                }
                continue;
            }
            seen_header = true;

            let Some((name, value)) = header_line.split_once(':') else {
                log::warn!("Ignoring malformed header line: {}", header_line);
                continue;
            };
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let length = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| TransportError::InvalidHeader(format!("Invalid Content-Length: {}", value.trim())))?;
                content_length = Some(length);
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FrameReader<R> {
    async fn next_frame(&mut self) -> Result<Option<String>, TransportError> {
        let content_length = match self.read_headers().await? {
            None => return Ok(None),
            Some(Some(length)) => length,
            Some(None) => return Err(TransportError::InvalidHeader("missing Content-Length".to_string())),
        };

        if content_length > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                length: content_length,
                max: self.max_frame_len,
            });
        }

        // ボディを読み取り（途中でEOFなら致命的）
        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        String::from_utf8(body).map(Some).map_err(|_| TransportError::InvalidUtf8)
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, body: &str) -> Result<(), TransportError> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Drain `receiver` through the codec into `writer` until every sender is gone.
///
/// A response that cannot be encoded is replaced by an InternalError response
/// for the same id; any other unencodable message is dropped.
pub async fn write_loop<W>(
    mut receiver: mpsc::UnboundedReceiver<Message>,
    codec: Arc<dyn MessageCodec>,
    mut writer: FrameWriter<W>,
    tracer: Option<Arc<MessageTracer>>,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(message) = receiver.recv().await {
        let (message, text) = match codec.encode_string(&message) {
            Ok(text) => (message, text),
            Err(e) => {
                log::error!("Failed to encode outgoing message: {}", e);
                let Message::Response(response) = message else {
                    continue;
                };
                let mut fallback = ResponseMessage::error(
                    response.id,
                    ResponseError::new(ErrorCode::InternalError, format!("Failed to encode response: {}", e)),
                );
                fallback.method = response.method;
                let fallback = Message::Response(fallback);
                match codec.encode_string(&fallback) {
                    Ok(text) => (fallback, text),
                    Err(e) => {
                        log::error!("Failed to encode error response: {}", e);
                        continue;
                    }
                }
            }
        };

        if let Some(tracer) = &tracer {
            tracer.on_sent(&message);
        }
        log::trace!("Sending: {}", text);
        writer.write_frame(&text).await?;
    }

    log::debug!("Outgoing channel closed, terminating write loop");
    Ok(())
}
