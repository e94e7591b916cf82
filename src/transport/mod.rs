//! Transport bindings for talking to an MCP server under validation
//!
//! Three concrete bindings share one interface:
//! - `stdio` - spawn the server as a child process, newline-delimited JSON
//! - `http` - POST each message to an HTTP endpoint
//! - `sse` - persistent event stream for inbound, POST for outbound
//!
//! The binding is chosen from the `--transport` flag when given, otherwise
//! from the target: http(s) URLs map to `http` (or `sse` when the path
//! points at an event stream), anything else is treated as a command to
//! spawn.

pub mod http;
pub mod mock;
pub mod sse;
pub mod stdio;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

pub use http::HttpTransport;
pub use mock::MockTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Errors surfaced by any transport binding
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON on the wire: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("server returned a bad response: {0}")]
    BadResponse(String),

    #[error("server process terminated unexpectedly{}", format_stderr(.stderr))]
    ProcessTerminated { stderr: String },

    #[error("no message received within {0:?}")]
    Timeout(Duration),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },

    #[error("transport is closed")]
    Closed,
}

fn format_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {})", stderr)
    }
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// One interface over all bindings. Implementations only need the message
/// primitives; `request` and `notify` are layered on top of them.
#[async_trait]
pub trait Transport: Send {
    /// Deliver one message to the server.
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound message.
    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, TransportError>;

    /// Release the underlying resources. Must be idempotent, including
    /// after a partially failed open.
    async fn close(&mut self) -> Result<(), TransportError>;

    fn kind(&self) -> TransportKind;

    /// Send a request and wait for the next response within `timeout`.
    /// Inbound notifications arriving first are skipped; id matching
    /// against the outstanding request happens in the session layer.
    async fn request(
        &mut self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        self.send(&JsonRpcMessage::Request(request)).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }
            match self.receive(remaining).await? {
                JsonRpcMessage::Response(response) => return Ok(response),
                other => {
                    tracing::debug!(?other, "ignoring non-response message while awaiting reply");
                }
            }
        }
    }

    /// Fire-and-forget notification.
    async fn notify(&mut self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        self.send(&JsonRpcMessage::Notification(notification)).await
    }
}

/// Shared transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-operation timeout
    pub timeout: Duration,
    /// Upper bound on a single serialized message
    pub max_message_size: usize,
    /// Bearer token attached to HTTP/SSE requests
    pub auth_token: Option<String>,
    /// Value of the MCP-Protocol-Version header on HTTP/SSE requests
    pub protocol_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_message_size: 10 * 1024 * 1024,
            auth_token: None,
            protocol_version: crate::protocol::mcp::LATEST_PROTOCOL_VERSION.to_string(),
        }
    }
}

/// The three transport bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "http" | "streamable_http" => Ok(TransportKind::Http),
            "sse" => Ok(TransportKind::Sse),
            _ => Err(anyhow::anyhow!(
                "unknown transport '{}', expected stdio, http, or sse",
                s
            )),
        }
    }
}

impl TransportKind {
    /// Pick a binding from the target when none was given explicitly.
    /// URLs whose path mentions an event stream go to `sse`, other URLs to
    /// `http`, and everything else is a command to spawn.
    pub fn detect(target: &str) -> TransportKind {
        let lower = target.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            if lower.contains("/sse") {
                TransportKind::Sse
            } else {
                TransportKind::Http
            }
        } else {
            TransportKind::Stdio
        }
    }
}

/// What the engine is pointed at: a command line to spawn or a remote URL.
#[derive(Debug, Clone)]
pub enum ServerTarget {
    Command {
        program: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
    },
    Endpoint { url: String },
}

impl ServerTarget {
    pub fn describe(&self) -> String {
        match self {
            ServerTarget::Command { program, args, .. } => {
                let mut parts = vec![program.clone()];
                parts.extend(args.iter().cloned());
                parts.join(" ")
            }
            ServerTarget::Endpoint { url } => url.clone(),
        }
    }
}

/// Open the binding selected by `kind` against `target`.
pub async fn open(
    kind: TransportKind,
    target: &ServerTarget,
    config: &TransportConfig,
) -> Result<Box<dyn Transport>, TransportError> {
    match (kind, target) {
        (TransportKind::Stdio, ServerTarget::Command { program, args, env }) => {
            let transport = StdioTransport::spawn(program, args, env, config).await?;
            Ok(Box::new(transport))
        }
        (TransportKind::Stdio, ServerTarget::Endpoint { .. }) => Err(TransportError::Open(
            "stdio transport needs a server command, not a URL".to_string(),
        )),
        (TransportKind::Http, ServerTarget::Endpoint { url }) => {
            let transport = HttpTransport::new(url, config)?;
            Ok(Box::new(transport))
        }
        (TransportKind::Sse, ServerTarget::Endpoint { url }) => {
            let transport = SseTransport::connect(url, config).await?;
            Ok(Box::new(transport))
        }
        (kind, ServerTarget::Command { .. }) => Err(TransportError::Open(format!(
            "{} transport needs an endpoint URL",
            kind
        ))),
    }
}
