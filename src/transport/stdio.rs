//! Process-pipe binding: the server runs as a child process and speaks
//! newline-delimited JSON over stdin/stdout

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::protocol::JsonRpcMessage;

use super::{Transport, TransportConfig, TransportError, TransportKind};

pub struct StdioTransport {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Arc<Mutex<Vec<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    max_message_size: usize,
}

impl StdioTransport {
    /// Spawn the server process with piped standard streams. Stderr is
    /// drained on a background task so a chatty server cannot block, and
    /// its output is attached to later failure diagnostics.
    pub async fn spawn(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TransportError::Open(format!("failed to spawn '{}': {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Open("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Open("child stdout not captured".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Open("child stderr not captured".to_string()))?;

        let stderr = Arc::new(Mutex::new(Vec::new()));
        let stderr_sink = Arc::clone(&stderr);
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "server_stderr", "{}", line);
                if let Ok(mut buf) = stderr_sink.lock() {
                    buf.push(line);
                }
            }
        });

        tracing::info!(program, "spawned server process");

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout).lines()),
            stderr,
            stderr_task: Some(stderr_task),
            max_message_size: config.max_message_size,
        })
    }

    /// Stderr captured from the child so far, newest last.
    pub fn stderr_output(&self) -> String {
        self.stderr
            .lock()
            .map(|buf| buf.join("\n"))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;

        let mut line = message.to_json()?;
        if line.len() > self.max_message_size {
            return Err(TransportError::Oversized {
                size: line.len(),
                limit: self.max_message_size,
            });
        }
        line.push('\n');

        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<JsonRpcMessage, TransportError> {
        let stdout = self.stdout.as_mut().ok_or(TransportError::Closed)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout));
            }

            let line = match tokio::time::timeout(remaining, stdout.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    // EOF on stdout: the server went away mid-conversation.
                    return Err(TransportError::ProcessTerminated {
                        stderr: self.stderr_output(),
                    });
                }
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(JsonRpcMessage::parse(trimmed)?);
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping stdin signals EOF, giving the server a chance to exit
        // on its own before the kill.
        self.stdin.take();
        self.stdout.take();

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        if let Some(mut child) = self.child.take() {
            let graceful =
                tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
            if graceful.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            tracing::debug!("server process closed");
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcNotification, JsonRpcRequest};

    fn config() -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_open_error() {
        let result =
            StdioTransport::spawn("definitely-not-a-real-binary-xyz", &[], &[], &config()).await;
        match result {
            Err(TransportError::Open(msg)) => assert!(msg.contains("failed to spawn")),
            other => panic!("expected Open error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        // cat echoes each line back, which is valid JSON-RPC as far as the
        // framing layer is concerned.
        let mut transport = StdioTransport::spawn("cat", &[], &[], &config())
            .await
            .unwrap();

        let request = JsonRpcRequest::new(1u64, "ping", None);
        transport
            .send(&JsonRpcMessage::Request(request))
            .await
            .unwrap();

        let echoed = transport.receive(Duration::from_secs(2)).await.unwrap();
        match echoed {
            JsonRpcMessage::Request(req) => assert_eq!(req.method, "ping"),
            other => panic!("unexpected message: {:?}", other),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_after_exit_reports_termination() {
        // true exits immediately without writing anything.
        let mut transport = StdioTransport::spawn("true", &[], &[], &config())
            .await
            .unwrap();

        let result = transport.receive(Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(TransportError::ProcessTerminated { .. })
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_times_out_when_silent() {
        // sleep holds the pipes open without writing.
        let mut transport = StdioTransport::spawn(
            "sleep",
            &["5".to_string()],
            &[],
            &config(),
        )
        .await
        .unwrap();

        let result = transport.receive(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut transport = StdioTransport::spawn("cat", &[], &[], &config())
            .await
            .unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        // After close both directions report Closed.
        let notification = JsonRpcNotification::new("notifications/initialized", None);
        let result = transport
            .send(&JsonRpcMessage::Notification(notification))
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            transport.receive(Duration::from_millis(10)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut transport = StdioTransport::spawn(
            "cat",
            &[],
            &[],
            &TransportConfig {
                max_message_size: 64,
                ..config()
            },
        )
        .await
        .unwrap();

        let big = "x".repeat(128);
        let request = JsonRpcRequest::new(1u64, big, None);
        let result = transport.send(&JsonRpcMessage::Request(request)).await;
        assert!(matches!(result, Err(TransportError::Oversized { .. })));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn env_is_passed_to_child() {
        let mut transport = StdioTransport::spawn(
            "sh",
            &["-c".to_string(), "printf '%s\\n' \"$MARKER\"".to_string()],
            &[("MARKER".to_string(), r#"{"jsonrpc":"2.0","method":"env"}"#.to_string())],
            &config(),
        )
        .await
        .unwrap();

        let msg = transport.receive(Duration::from_secs(2)).await.unwrap();
        match msg {
            JsonRpcMessage::Notification(n) => assert_eq!(n.method, "env"),
            other => panic!("unexpected message: {:?}", other),
        }
        transport.close().await.unwrap();
    }
}
