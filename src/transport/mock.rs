//! Scripted transport for tests
//!
//! Incoming messages are queued ahead of time; everything sent through the
//! transport is recorded for assertions. No process or socket involved.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::{JsonRpcError, JsonRpcMessage, JsonRpcResponse, RequestId};

use super::{Transport, TransportError, TransportKind};

/// One scripted step: a message to hand out, or an error to inject.
enum ScriptStep {
    Message(JsonRpcMessage),
    Error(TransportError),
}

#[derive(Default)]
struct MockState {
    script: VecDeque<ScriptStep>,
    sent: Vec<JsonRpcMessage>,
    closed: bool,
    close_count: u32,
    response_delay: Option<Duration>,
}

/// Scripted transport. Clones share state so a test can keep a handle for
/// assertions while the session owns the boxed transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an inbound message.
    pub async fn script_message(&self, message: JsonRpcMessage) {
        self.state
            .lock()
            .await
            .script
            .push_back(ScriptStep::Message(message));
    }

    /// Queue a successful response with the given id.
    pub async fn script_result(&self, id: u64, result: Value) {
        self.script_message(JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(id),
            result: Some(result),
            error: None,
        }))
        .await;
    }

    /// Queue an error response with the given id.
    pub async fn script_error_response(&self, id: u64, code: i32, message: &str) {
        self.script_message(JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(id),
            result: None,
            error: Some(JsonRpcError::new(code, message)),
        }))
        .await;
    }

    /// Queue a transport failure to be returned by the next `receive`.
    pub async fn script_failure(&self, error: TransportError) {
        self.state
            .lock()
            .await
            .script
            .push_back(ScriptStep::Error(error));
    }

    /// Delay every `receive` by `delay` before consulting the script,
    /// still honoring the caller's timeout.
    pub async fn set_response_delay(&self, delay: Duration) {
        self.state.lock().await.response_delay = Some(delay);
    }

    pub async fn sent_messages(&self) -> Vec<JsonRpcMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Methods of everything sent, requests and notifications alike.
    pub async fn sent_methods(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Request(r) => Some(r.method.clone()),
                JsonRpcMessage::Notification(n) => Some(n.method.clone()),
                JsonRpcMessage::Response(_) => None,
            })
            .collect()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn close_count(&self) -> u32 {
        self.state.lock().await.close_count
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.sent.push(message.clone());
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        let delay = {
            let state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.response_delay
        };

        if let Some(delay) = delay {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        match state.script.pop_front() {
            Some(ScriptStep::Message(message)) => Ok(message),
            Some(ScriptStep::Error(error)) => Err(error),
            None => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.close_count += 1;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_messages_come_back_in_order() {
        let mut transport = MockTransport::new();
        transport.script_result(1, json!({"n": 1})).await;
        transport.script_result(2, json!({"n": 2})).await;

        let first = transport.receive(Duration::from_millis(10)).await.unwrap();
        let second = transport.receive(Duration::from_millis(10)).await.unwrap();
        match (first, second) {
            (JsonRpcMessage::Response(a), JsonRpcMessage::Response(b)) => {
                assert_eq!(a.id, RequestId::Number(1));
                assert_eq!(b.id, RequestId::Number(2));
            }
            other => panic!("unexpected messages: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_script_times_out() {
        let mut transport = MockTransport::new();
        let result = transport.receive(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn scripted_failure_is_returned() {
        let mut transport = MockTransport::new();
        transport
            .script_failure(TransportError::ProcessTerminated {
                stderr: "crash".to_string(),
            })
            .await;
        let result = transport.receive(Duration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(TransportError::ProcessTerminated { .. })
        ));
    }

    #[tokio::test]
    async fn sends_are_recorded() {
        let mut transport = MockTransport::new();
        let observer = transport.clone();

        transport
            .send(&JsonRpcMessage::Request(JsonRpcRequest::new(
                1u64,
                "initialize",
                None,
            )))
            .await
            .unwrap();

        assert_eq!(observer.sent_methods().await, vec!["initialize"]);
    }

    #[tokio::test]
    async fn default_request_impl_pairs_send_and_receive() {
        let mut transport = MockTransport::new();
        transport.script_result(1, json!({"ok": true})).await;

        let response = transport
            .request(
                JsonRpcRequest::new(1u64, "ping", None),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(1));
        assert_eq!(transport.sent_methods().await, vec!["ping"]);
    }

    #[tokio::test]
    async fn default_request_impl_skips_interleaved_notifications() {
        let mut transport = MockTransport::new();
        transport
            .script_message(JsonRpcMessage::Notification(
                crate::protocol::JsonRpcNotification::new("notifications/progress", None),
            ))
            .await;
        transport.script_result(1, json!({})).await;

        let response = transport
            .request(
                JsonRpcRequest::new(1u64, "tools/list", None),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(response.id, RequestId::Number(1));
    }

    #[tokio::test]
    async fn response_delay_respects_caller_timeout() {
        let mut transport = MockTransport::new();
        transport.script_result(1, json!({})).await;
        transport
            .set_response_delay(Duration::from_millis(100))
            .await;

        let result = transport.receive(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn close_tracks_idempotence() {
        let mut transport = MockTransport::new();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(transport.is_closed().await);
        assert_eq!(transport.close_count().await, 2);
        assert!(matches!(
            transport
                .send(&JsonRpcMessage::Request(JsonRpcRequest::new(
                    1u64, "x", None
                )))
                .await,
            Err(TransportError::Closed)
        ));
    }
}
