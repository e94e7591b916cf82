//! HTTP binding: every outbound message is a POST, replies arrive in the
//! response body either as plain JSON or as a short SSE fragment

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;

use crate::protocol::JsonRpcMessage;

use super::{Transport, TransportConfig, TransportError, TransportKind};

pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const ACCEPT_VALUE: &str = "application/json, text/event-stream";

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: url::Url,
    session_id: Option<String>,
    auth_token: Option<String>,
    protocol_version: String,
    /// Replies extracted from POST bodies, handed out by `receive`
    inbound: VecDeque<JsonRpcMessage>,
    closed: bool,
}

impl HttpTransport {
    pub fn new(endpoint: &str, config: &TransportConfig) -> Result<Self, TransportError> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| TransportError::Open(format!("invalid endpoint URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self {
            client,
            endpoint,
            session_id: None,
            auth_token: config.auth_token.clone(),
            protocol_version: config.protocol_version.clone(),
            inbound: VecDeque::new(),
            closed: false,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn build_post(&self, body: &JsonRpcMessage) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ACCEPT_VALUE)
            .header(PROTOCOL_VERSION_HEADER, &self.protocol_version)
            .json(body);
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(session) = &self.session_id {
            builder = builder.header(SESSION_ID_HEADER, session);
        }
        builder
    }

    fn capture_session_id(&mut self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(SESSION_ID_HEADER) {
            if let Ok(id) = value.to_str() {
                if self.session_id.as_deref() != Some(id) {
                    tracing::debug!(session_id = id, "captured session id");
                    self.session_id = Some(id.to_string());
                }
            }
        }
    }

    /// Pull JSON-RPC messages out of a POST response body. Servers may
    /// answer with a plain JSON object or with an SSE fragment whose
    /// `data:` lines carry the messages.
    fn parse_body(&mut self, content_type: &str, body: &str) -> Result<(), TransportError> {
        if body.trim().is_empty() {
            return Ok(());
        }

        if content_type.contains("text/event-stream") {
            for line in body.lines() {
                if let Some(data) = line.strip_prefix("data:") {
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    self.inbound.push_back(JsonRpcMessage::parse(data)?);
                }
            }
            Ok(())
        } else {
            self.inbound.push_back(JsonRpcMessage::parse(body.trim())?);
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let response = self.build_post(message).send().await?;
        let status = response.status();
        self.capture_session_id(&response);

        if status == StatusCode::NOT_FOUND && self.session_id.is_some() {
            // The server dropped our session.
            self.session_id = None;
            return Err(TransportError::BadResponse(
                "session expired (404 with active session)".to_string(),
            ));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::BadResponse(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        if matches!(message, JsonRpcMessage::Notification(_)) {
            // 202 Accepted is the expected answer to a notification; any
            // 2xx body is ignored.
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await?;
        self.parse_body(&content_type, &body)
            .map_err(|e| match e {
                TransportError::Codec(err) => TransportError::BadResponse(format!(
                    "response body is not valid JSON-RPC: {}",
                    err
                )),
                other => other,
            })
    }

    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Some(message) = self.inbound.pop_front() {
            return Ok(message);
        }
        // Replies only ever arrive inside POST responses, so an empty
        // queue cannot fill by waiting. Honor the timeout contract anyway.
        tokio::time::sleep(timeout).await;
        Err(TransportError::Timeout(timeout))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inbound.clear();

        if let Some(session) = self.session_id.take() {
            // Best effort: servers without session teardown answer 405.
            let mut builder = self
                .client
                .delete(self.endpoint.clone())
                .header(SESSION_ID_HEADER, &session)
                .timeout(Duration::from_secs(5));
            if let Some(token) = &self.auth_token {
                builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            match builder.send().await {
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "session delete");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "session delete failed");
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
