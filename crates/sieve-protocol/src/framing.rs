//! One JSON document per exchange over a stream socket.
//!
//! There is no length prefix. A message starts at the first non-whitespace
//! byte, which must be `{`, and ends when the brace nesting depth returns to
//! zero. Braces inside JSON string literals are not counted, so any well
//! formed document frames correctly. A receive that cannot complete a
//! message within the receive timeout fails instead of hanging.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` or direct indexing
//! - Peer closure, malformed input and timeouts surface as [`FramingError`]

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

/// Default time allowed for a complete message to arrive.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed for a message to be written.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

const READ_CHUNK: usize = 4096;

/// Errors raised while exchanging framed messages.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Timed out waiting for a complete message")]
    Timeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

/// Tracks brace depth across chunk boundaries.
#[derive(Debug, Default)]
struct BraceScanner {
    started: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl BraceScanner {
    /// Feeds one byte. Returns true when it closes the outermost object.
    fn push(&mut self, byte: u8) -> Result<bool, FramingError> {
        if !self.started {
            if byte.is_ascii_whitespace() {
                return Ok(false);
            }
            if byte != b'{' {
                return Err(FramingError::MalformedMessage(format!(
                    "expected '{{' as first byte, got {:?}",
                    char::from(byte)
                )));
            }
            self.started = true;
            self.depth = 1;
            return Ok(false);
        }

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return Ok(false);
        }

        match byte {
            b'"' => self.in_string = true,
            b'{' => self.depth += 1,
            b'}' => {
                self.depth = self.depth.saturating_sub(1);
                return Ok(self.depth == 0);
            }
            _ => {}
        }
        Ok(false)
    }
}

/// A connected stream carrying brace-framed JSON documents.
pub struct FramedChannel<S> {
    stream: S,
    pending: VecDeque<u8>,
    receive_timeout: Duration,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream with the default receive timeout.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// Overrides the receive timeout.
    #[must_use]
    pub fn with_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Serializes `doc` and writes it fully.
    pub async fn send(&mut self, doc: &Value) -> Result<(), FramingError> {
        let text = serde_json::to_string(doc).map_err(|e| FramingError::Json(e.to_string()))?;
        self.send_raw(&text).await
    }

    /// Writes an already serialized document.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), FramingError> {
        let write = async {
            self.stream.write_all(text.as_bytes()).await?;
            self.stream.flush().await
        };

        match timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => {
                trace!(bytes = text.len(), "Sent message");
                Ok(())
            }
            Ok(Err(e)) => Err(FramingError::Io(e.to_string())),
            Err(_) => Err(FramingError::Timeout),
        }
    }

    /// Receives one document and parses it.
    pub async fn receive(&mut self) -> Result<Value, FramingError> {
        let text = self.receive_raw().await?;
        serde_json::from_str(&text).map_err(|e| FramingError::Json(e.to_string()))
    }

    /// Receives the text of one document without parsing it.
    pub async fn receive_raw(&mut self) -> Result<String, FramingError> {
        match timeout(self.receive_timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(FramingError::Timeout),
        }
    }

    async fn read_frame(&mut self) -> Result<String, FramingError> {
        let mut scanner = BraceScanner::default();
        let mut frame = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            while let Some(byte) = self.pending.pop_front() {
                frame.push(byte);
                if scanner.push(byte)? {
                    trace!(bytes = frame.len(), "Received message");
                    return String::from_utf8(frame)
                        .map_err(|e| FramingError::MalformedMessage(e.to_string()));
                }
                if frame.len() > MAX_MESSAGE_SIZE {
                    return Err(FramingError::MessageTooLarge {
                        size: frame.len(),
                        max: MAX_MESSAGE_SIZE,
                    });
                }
            }

            let read = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| FramingError::Io(e.to_string()))?;
            if read == 0 {
                return Err(FramingError::ConnectionClosed);
            }
            self.pending.extend(chunk.iter().take(read));
        }
    }
}
