//! MCP transport layer implementations.
//!
//! Every binding implements the same `send / receive / close` contract.
//! Stdio and HTTP live here; the SSE binding is in [`crate::mcp::sse`].

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::Method;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Maximum accepted length of one stdio line.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Message::Response(response)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notification: JsonRpcNotification) -> Self {
        Message::Notification(notification)
    }
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Emit one outbound message.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receive the next request.
    ///
    /// Returns [`Error::EndOfStream`] once the peer is gone and
    /// [`Error::Parse`] for undecodable input.
    async fn receive(&self) -> Result<JsonRpcRequest>;

    /// Close the transport.
    async fn close(&self) -> Result<()>;
}

// ===== Stdio =====

/// Line-delimited JSON over a reader/writer pair.
pub struct StdioTransport<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl StdioTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout> {
    /// Transport over the process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::with_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_io(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Read one line of at most [`MAX_LINE_BYTES`]. `None` on end of input.
    async fn read_line(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let n = (&mut *reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }

        if line.len() > MAX_LINE_BYTES && !line.ends_with(b"\n") {
            // Discard the remainder of the oversized line.
            let mut scratch = Vec::new();
            loop {
                scratch.clear();
                let n = (&mut *reader)
                    .take(MAX_LINE_BYTES as u64)
                    .read_until(b'\n', &mut scratch)
                    .await?;
                if n == 0 || scratch.ends_with(b"\n") {
                    break;
                }
            }
            return Err(Error::Parse(format!(
                "message exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }

        Ok(Some(line))
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: Message) -> Result<()> {
        let json = message.to_json()?;
        trace!("Sending: {}", json);

        // One lock per message so concurrent senders never interleave.
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<JsonRpcRequest> {
        let mut reader = self.reader.lock().await;
        loop {
            let Some(line) = Self::read_line(&mut reader).await? else {
                return Err(Error::EndOfStream);
            };

            let trimmed = line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            trace!("Received: {}", String::from_utf8_lossy(trimmed));
            return serde_json::from_slice(trimmed).map_err(|e| Error::Parse(e.to_string()));
        }
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.writer.lock().await.flush().await {
            warn!("Error flushing output on close: {}", e);
        }
        Ok(())
    }
}

// ===== HTTP =====

/// One HTTP request/response pair.
pub struct HttpTransport {
    method: Method,
    content_type: Option<String>,
    body: Bytes,
    outbound: Mutex<Option<Message>>,
}

impl HttpTransport {
    pub fn new(method: Method, content_type: Option<String>, body: Bytes) -> Self {
        Self {
            method,
            content_type,
            body,
            outbound: Mutex::new(None),
        }
    }

    /// Take the message written by `send`, if any.
    pub async fn take_outbound(&self) -> Option<Message> {
        self.outbound.lock().await.take()
    }
}

/// Whether a Content-Type header names JSON, ignoring parameters.
pub fn is_json_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|media| media.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: Message) -> Result<()> {
        *self.outbound.lock().await = Some(message);
        Ok(())
    }

    async fn receive(&self) -> Result<JsonRpcRequest> {
        if self.method != Method::POST {
            return Err(Error::MethodNotAllowed(self.method.to_string()));
        }

        let content_type = self.content_type.as_deref().unwrap_or("");
        if !is_json_content_type(content_type) {
            return Err(Error::UnsupportedContentType(content_type.to_string()));
        }

        serde_json::from_slice(&self.body).map_err(|e| Error::Parse(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
