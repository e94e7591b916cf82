//! SSE binding: one long-lived GET stream carries inbound messages,
//! outbound messages are POSTed to the endpoint the stream announces

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::protocol::JsonRpcMessage;

use super::http::PROTOCOL_VERSION_HEADER;
use super::{Transport, TransportConfig, TransportError, TransportKind};

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental SSE frame parser. Chunks from the byte stream may split
/// lines and events arbitrarily, so state is kept across pushes.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(SseEvent {
                        name: self
                            .event_name
                            .take()
                            .unwrap_or_else(|| "message".to_string()),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                } else {
                    self.event_name = None;
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event_name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines.push(value.trim().to_string());
            }
            // Comment lines (":") and unknown fields are ignored.
        }

        events
    }
}

pub struct SseTransport {
    post_client: reqwest::Client,
    post_url: url::Url,
    inbound: Option<mpsc::Receiver<JsonRpcMessage>>,
    stream_task: Option<JoinHandle<()>>,
    auth_token: Option<String>,
    protocol_version: String,
    closed: bool,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its POST
    /// endpoint. The stream runs on a background task for the life of the
    /// transport.
    pub async fn connect(url: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let base = url::Url::parse(url)
            .map_err(|e| TransportError::Open(format!("invalid endpoint URL: {}", e)))?;

        // The stream client must not carry a whole-request timeout or the
        // long-lived GET would be cut off.
        let stream_client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(TransportError::Http)?;
        let post_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .build()
            .map_err(TransportError::Http)?;

        let mut request = stream_client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .header(PROTOCOL_VERSION_HEADER, &config.protocol_version);
        if let Some(token) = &config.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::BadResponse(format!(
                "event stream rejected with HTTP {}",
                response.status()
            )));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (message_tx, message_rx) = mpsc::channel(64);
        let stream_base = base.clone();

        let stream_task = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut parser = SseParser::default();
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "event stream broke");
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk);
                for event in parser.push(&text) {
                    match event.name.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let resolved = stream_base.join(&event.data);
                                let _ = tx.send(resolved);
                            }
                        }
                        _ => match JsonRpcMessage::parse(&event.data) {
                            Ok(message) => {
                                if message_tx.send(message).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding unparseable event");
                            }
                        },
                    }
                }
            }
        });

        // The legacy flow opens with an endpoint event naming where to
        // POST. A server that never sends one is not speaking SSE MCP.
        let post_url = match tokio::time::timeout(config.timeout, endpoint_rx).await {
            Ok(Ok(Ok(url))) => url,
            Ok(Ok(Err(e))) => {
                stream_task.abort();
                return Err(TransportError::Open(format!(
                    "server announced an invalid endpoint: {}",
                    e
                )));
            }
            Ok(Err(_)) => {
                stream_task.abort();
                return Err(TransportError::Open(
                    "event stream ended before announcing an endpoint".to_string(),
                ));
            }
            Err(_) => {
                stream_task.abort();
                return Err(TransportError::Open(format!(
                    "no endpoint event within {:?}",
                    config.timeout
                )));
            }
        };

        tracing::info!(%post_url, "event stream established");

        Ok(Self {
            post_client,
            post_url,
            inbound: Some(message_rx),
            stream_task: Some(stream_task),
            auth_token: config.auth_token.clone(),
            protocol_version: config.protocol_version.clone(),
            closed: false,
        })
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut builder = self
            .post_client
            .post(self.post_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(PROTOCOL_VERSION_HEADER, &self.protocol_version)
            .json(message);
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(TransportError::BadResponse(format!(
                "POST rejected with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        let inbound = self.inbound.as_mut().ok_or(TransportError::Closed)?;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::BadResponse(
                "event stream closed by server".to_string(),
            )),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.inbound.take();
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_complete_event() {
        let mut parser = SseParser::default();
        let events = parser.push("event: endpoint\ndata: /messages?session=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
    }

    #[test]
    fn parser_defaults_to_message_event() {
        let mut parser = SseParser::default();
        let events = parser.push("data: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "message");
    }

    #[test]
    fn parser_reassembles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push("da").is_empty());
        assert!(parser.push("ta: hel").is_empty());
        assert!(parser.push("lo\n").is_empty());
        let events = parser.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn parser_joins_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn parser_ignores_comments_and_crlf() {
        let mut parser = SseParser::default();
        let events = parser.push(": keepalive\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn parser_emits_multiple_events_from_one_chunk() {
        let mut parser = SseParser::default();
        let events = parser.push("data: a\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let result = SseTransport::connect("::nope::", &TransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::Open(_))));
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_fails() {
        let config = TransportConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let result = SseTransport::connect("http://127.0.0.1:9/sse", &config).await;
        assert!(result.is_err());
    }
}
