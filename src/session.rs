//! Validation session: owns the transport, the handshake state machine,
//! and everything discovered about the server along the way

use std::time::Duration;

use serde_json::Value;

use crate::errors::{ProtocolViolation, ValidationError};
use crate::protocol::jsonrpc::error_codes;
use crate::protocol::mcp::{
    self, InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult,
};
use crate::protocol::{
    HandshakeContext, HandshakeState, IdSequence, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId,
};
use crate::transport::{Transport, TransportError};

/// Items the capability probes enumerated. An entry is `Some` only for
/// capabilities the server advertised and we actually probed, so an empty
/// list stays distinguishable from "never advertised".
#[derive(Debug, Default, Clone)]
pub struct DiscoveredItems {
    pub tools: Option<Vec<String>>,
    pub prompts: Option<Vec<String>>,
    pub resources: Option<Vec<String>>,
}

pub struct Session {
    transport: Box<dyn Transport>,
    ids: IdSequence,
    handshake: HandshakeContext,
    timeout: Duration,
    discovered: DiscoveredItems,
    /// Set when the server negotiated a version outside our support window
    version_warning: Option<String>,
    closed: bool,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            ids: IdSequence::new(),
            handshake: HandshakeContext::new(),
            timeout,
            discovered: DiscoveredItems::default(),
            version_warning: None,
            closed: false,
        }
    }

    pub fn handshake(&self) -> &HandshakeContext {
        &self.handshake
    }

    pub fn discovered(&self) -> &DiscoveredItems {
        &self.discovered
    }

    pub fn version_warning(&self) -> Option<&str> {
        self.version_warning.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one request and insist the reply belongs to it: a response
    /// whose id differs from the outstanding id is a protocol violation,
    /// not something to silently wait past.
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, ValidationError> {
        let id = self.ids.next_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let response = self
            .transport
            .request(request, self.timeout)
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !self.id_matches(&id, &response.id) {
            let violation = ProtocolViolation::IdMismatch {
                expected: id.to_string(),
                got: response.id.to_string(),
            };
            self.handshake.fail(violation.to_string());
            return Err(violation.into());
        }
        if !response.is_well_formed() {
            let violation = ProtocolViolation::MalformedResponse(format!(
                "reply to '{}' must carry exactly one of result or error",
                method
            ));
            self.handshake.fail(violation.to_string());
            return Err(violation.into());
        }
        Ok(response)
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), ValidationError> {
        self.transport
            .notify(JsonRpcNotification::new(method, params))
            .await
            .map_err(|e| self.map_transport_error(e))
    }

    /// Some servers echo numeric ids back as strings; that is tolerated
    /// as long as the value matches.
    fn id_matches(&self, sent: &RequestId, got: &RequestId) -> bool {
        if sent == got {
            return true;
        }
        matches!((sent, got), (RequestId::Number(n), RequestId::String(s)) if s == &n.to_string())
    }

    fn map_transport_error(&mut self, error: TransportError) -> ValidationError {
        self.handshake.fail(error.to_string());
        match error {
            TransportError::Timeout(d) => ValidationError::timeout(d.as_secs().max(1)),
            other => ValidationError::Transport(other),
        }
    }

    /// Run initialize and the initialized notification. On success the
    /// handshake lands in Initialized with the server's identity and
    /// capabilities recorded.
    pub async fn initialize(&mut self) -> Result<(), ValidationError> {
        self.handshake
            .transition_to(HandshakeState::Initializing)
            .map_err(|e| {
                ValidationError::Protocol(ProtocolViolation::MalformedResponse(e.to_string()))
            })?;

        let params = serde_json::to_value(InitializeParams::validation_default())
            .map_err(|e| ValidationError::Transport(TransportError::Codec(e)))?;
        let response = self.request(mcp::methods::INITIALIZE, Some(params)).await?;

        if let Some(error) = response.error {
            let violation = ProtocolViolation::InitializeRejected(error.to_string());
            self.handshake.fail(violation.to_string());
            return Err(violation.into());
        }

        let result = response.result.unwrap_or(Value::Null);

        // protocolVersion is checked on the raw value first: its absence
        // is a distinct hard failure, not a generic parse error.
        let version = match result.get("protocolVersion").and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                let violation = ProtocolViolation::MissingProtocolVersion;
                self.handshake.fail(violation.to_string());
                return Err(violation.into());
            }
        };

        if !mcp::is_supported_version(&version) {
            self.version_warning = Some(format!(
                "server negotiated unsupported protocol version '{}' (supported: {})",
                version,
                mcp::SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ));
            tracing::warn!(version, "unsupported protocol version");
        }

        let initialized: InitializeResult = serde_json::from_value(result).map_err(|e| {
            let violation =
                ProtocolViolation::MalformedResponse(format!("invalid initialize result: {}", e));
            self.handshake.fail(violation.to_string());
            ValidationError::Protocol(violation)
        })?;

        tracing::info!(
            server = %initialized.server_info.name,
            version = %initialized.server_info.version,
            protocol = %initialized.protocol_version,
            "initialize accepted"
        );

        self.handshake
            .accept_initialize(
                initialized.protocol_version,
                initialized.capabilities,
                initialized.server_info.name,
                initialized.server_info.version,
            )
            .map_err(|e| {
                ValidationError::Protocol(ProtocolViolation::MalformedResponse(e.to_string()))
            })?;

        self.notify(mcp::methods::INITIALIZED, None).await?;
        Ok(())
    }

    pub fn begin_probing(&mut self) -> Result<(), ValidationError> {
        self.handshake
            .transition_to(HandshakeState::ProbingCapabilities)
            .map_err(|e| {
                ValidationError::Protocol(ProtocolViolation::MalformedResponse(e.to_string()))
            })
    }

    /// Record a failure decided outside the session, for callers that
    /// cancel an in-flight session future instead of seeing its error.
    pub fn fail_handshake(&mut self, reason: impl Into<String>) {
        self.handshake.fail(reason);
    }

    pub fn complete(&mut self) -> Result<(), ValidationError> {
        self.handshake
            .transition_to(HandshakeState::Complete)
            .map_err(|e| {
                ValidationError::Protocol(ProtocolViolation::MalformedResponse(e.to_string()))
            })
    }

    /// tools/list probe. Caller is responsible for only probing when the
    /// capability was advertised.
    pub async fn list_tools(&mut self) -> Result<Vec<String>, ValidationError> {
        let response = self.request(mcp::methods::TOOLS_LIST, None).await?;
        let result = Self::expect_result(response, mcp::methods::TOOLS_LIST)?;
        let parsed: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            ValidationError::Protocol(ProtocolViolation::MalformedResponse(format!(
                "invalid tools/list result: {}",
                e
            )))
        })?;
        let names: Vec<String> = parsed.tools.into_iter().map(|t| t.name).collect();
        self.discovered.tools = Some(names.clone());
        Ok(names)
    }

    pub async fn list_prompts(&mut self) -> Result<Vec<String>, ValidationError> {
        let response = self.request(mcp::methods::PROMPTS_LIST, None).await?;
        let result = Self::expect_result(response, mcp::methods::PROMPTS_LIST)?;
        let parsed: ListPromptsResult = serde_json::from_value(result).map_err(|e| {
            ValidationError::Protocol(ProtocolViolation::MalformedResponse(format!(
                "invalid prompts/list result: {}",
                e
            )))
        })?;
        let names: Vec<String> = parsed.prompts.into_iter().map(|p| p.name).collect();
        self.discovered.prompts = Some(names.clone());
        Ok(names)
    }

    pub async fn list_resources(&mut self) -> Result<Vec<String>, ValidationError> {
        let response = self.request(mcp::methods::RESOURCES_LIST, None).await?;
        let result = Self::expect_result(response, mcp::methods::RESOURCES_LIST)?;
        let parsed: ListResourcesResult = serde_json::from_value(result).map_err(|e| {
            ValidationError::Protocol(ProtocolViolation::MalformedResponse(format!(
                "invalid resources/list result: {}",
                e
            )))
        })?;
        let names: Vec<String> = parsed.resources.into_iter().map(|r| r.name).collect();
        self.discovered.resources = Some(names.clone());
        Ok(names)
    }

    /// ping round trip. `Ok(None)` means the server answered with
    /// method-not-found, which is allowed for this optional method.
    pub async fn ping(&mut self) -> Result<Option<Duration>, ValidationError> {
        let started = std::time::Instant::now();
        let response = self.request(mcp::methods::PING, None).await?;
        if let Some(error) = &response.error {
            if error.code == error_codes::METHOD_NOT_FOUND {
                return Ok(None);
            }
            return Err(ValidationError::Protocol(ProtocolViolation::MalformedResponse(
                format!("ping answered with unexpected error: {}", error),
            )));
        }
        Ok(Some(started.elapsed()))
    }

    /// Send a deliberately unknown method and return the raw response for
    /// the error-compliance check.
    pub async fn probe_unknown_method(&mut self) -> Result<JsonRpcResponse, ValidationError> {
        self.request("mcp_validate/nonexistent_method", None).await
    }

    fn expect_result(response: JsonRpcResponse, method: &str) -> Result<Value, ValidationError> {
        match response.error {
            Some(error) => Err(ValidationError::Protocol(
                ProtocolViolation::MalformedResponse(format!(
                    "'{}' answered with an error: {}",
                    method, error
                )),
            )),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Close the transport. Safe to call repeatedly and after failures;
    /// teardown must run no matter how the run ended.
    pub async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.close().await {
            tracing::warn!(error = %e, "transport close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn session_with(mock: &MockTransport) -> Session {
        Session::new(Box::new(mock.clone()), Duration::from_millis(200))
    }

    fn initialize_result() -> Value {
        json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "demo", "version": "1.0.0"}
        })
    }

    #[tokio::test]
    async fn initialize_happy_path() {
        let mock = MockTransport::new();
        mock.script_result(1, initialize_result()).await;
        let mut session = session_with(&mock);

        session.initialize().await.unwrap();

        assert_eq!(session.handshake().state(), HandshakeState::Initialized);
        assert_eq!(session.handshake().server_info(), Some(("demo", "1.0.0")));
        assert!(session.handshake().server_has_tools());
        assert!(session.version_warning().is_none());
        assert_eq!(
            mock.sent_methods().await,
            vec!["initialize", "notifications/initialized"]
        );
    }

    #[tokio::test]
    async fn missing_protocol_version_is_hard_failure() {
        let mock = MockTransport::new();
        mock.script_result(
            1,
            json!({
                "capabilities": {},
                "serverInfo": {"name": "demo", "version": "1.0"}
            }),
        )
        .await;
        let mut session = session_with(&mock);

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Protocol(ProtocolViolation::MissingProtocolVersion)
        ));
        assert!(session.handshake().is_failed());
        // The initialized notification must not have been sent.
        assert_eq!(mock.sent_methods().await, vec!["initialize"]);
    }

    #[tokio::test]
    async fn unsupported_version_is_warning_not_failure() {
        let mock = MockTransport::new();
        mock.script_result(
            1,
            json!({
                "protocolVersion": "2019-01-01",
                "capabilities": {},
                "serverInfo": {"name": "old", "version": "0.1"}
            }),
        )
        .await;
        let mut session = session_with(&mock);

        session.initialize().await.unwrap();
        assert_eq!(session.handshake().state(), HandshakeState::Initialized);
        assert!(session
            .version_warning()
            .is_some_and(|w| w.contains("2019-01-01")));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_protocol_violation() {
        let mock = MockTransport::new();
        mock.script_result(99, json!({"ok": true})).await;
        let mut session = session_with(&mock);

        let err = session.request("ping", None).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Protocol(ProtocolViolation::IdMismatch { .. })
        ));
        assert!(session.handshake().is_failed());
    }

    #[tokio::test]
    async fn string_echo_of_numeric_id_is_tolerated() {
        let mock = MockTransport::new();
        mock.script_message(crate::protocol::JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: RequestId::String("1".to_string()),
            result: Some(json!({})),
            error: None,
        }))
        .await;
        let mut session = session_with(&mock);

        assert!(session.request("ping", None).await.is_ok());
    }

    #[tokio::test]
    async fn initialize_error_response_is_rejected() {
        let mock = MockTransport::new();
        mock.script_error_response(1, -32600, "nope").await;
        let mut session = session_with(&mock);

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Protocol(ProtocolViolation::InitializeRejected(_))
        ));
        assert!(session.handshake().is_failed());
    }

    #[tokio::test]
    async fn request_timeout_maps_to_timeout_error() {
        let mock = MockTransport::new();
        let mut session = session_with(&mock);

        let err = session.request("ping", None).await.unwrap_err();
        assert!(matches!(err, ValidationError::Timeout { .. }));
        assert!(session.handshake().is_failed());
    }

    #[tokio::test]
    async fn list_tools_records_discovered_names() {
        let mock = MockTransport::new();
        mock.script_result(
            1,
            json!({"tools": [{"name": "read"}, {"name": "write"}]}),
        )
        .await;
        let mut session = session_with(&mock);

        let names = session.list_tools().await.unwrap();
        assert_eq!(names, vec!["read", "write"]);
        assert_eq!(
            session.discovered().tools.as_deref(),
            Some(["read".to_string(), "write".to_string()].as_slice())
        );
        assert!(session.discovered().prompts.is_none());
    }

    #[tokio::test]
    async fn empty_tool_list_is_recorded_not_dropped() {
        let mock = MockTransport::new();
        mock.script_result(1, json!({"tools": []})).await;
        let mut session = session_with(&mock);

        let names = session.list_tools().await.unwrap();
        assert!(names.is_empty());
        assert_eq!(session.discovered().tools.as_deref(), Some([].as_slice()));
    }

    #[tokio::test]
    async fn ping_method_not_found_is_none() {
        let mock = MockTransport::new();
        mock.script_error_response(1, -32601, "Method not found").await;
        let mut session = session_with(&mock);

        assert_eq!(session.ping().await.unwrap(), None);
    }

    #[tokio::test]
    async fn ping_success_measures_time() {
        let mock = MockTransport::new();
        mock.script_result(1, json!({})).await;
        let mut session = session_with(&mock);

        assert!(session.ping().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_always_closes() {
        let mock = MockTransport::new();
        let mut session = session_with(&mock);

        // Fail the handshake first; teardown must still close.
        let _ = session.request("ping", None).await;
        session.teardown().await;
        session.teardown().await;

        assert!(mock.is_closed().await);
        assert_eq!(mock.close_count().await, 1);
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_complete() {
        let mock = MockTransport::new();
        mock.script_result(1, initialize_result()).await;
        mock.script_result(2, json!({"tools": []})).await;
        let mut session = session_with(&mock);

        session.initialize().await.unwrap();
        session.begin_probing().unwrap();
        session.list_tools().await.unwrap();
        session.complete().unwrap();

        assert!(session.handshake().is_complete());
    }
}
