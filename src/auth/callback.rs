//! Loopback redirect listener for the authorization-code callback
//!
//! Two concurrent halves: an accept loop that hands the first callback to
//! a oneshot channel, and the waiter racing that channel against the auth
//! timeout. Any callback after the first gets the same success page and is
//! otherwise ignored.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::AuthError;

pub const CALLBACK_PORT: u16 = 8765;
pub const CALLBACK_PATH: &str = "/callback";

const SUCCESS_PAGE: &str = "<html><body><h2>Authorization received.</h2>\
<p>You can close this window and return to the terminal.</p></body></html>";

/// Parameters delivered to the redirect URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub struct CallbackListener {
    accept_task: JoinHandle<()>,
    receiver: oneshot::Receiver<CallbackParams>,
    redirect_uri: String,
}

impl CallbackListener {
    /// Bind the fixed loopback port and start accepting.
    pub async fn bind() -> Result<Self, AuthError> {
        Self::bind_port(CALLBACK_PORT).await
    }

    pub async fn bind_port(port: u16) -> Result<Self, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::Callback(format!("cannot bind 127.0.0.1:{}: {}", port, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| AuthError::Callback(e.to_string()))?;
        let redirect_uri = format!("http://{}{}", local, CALLBACK_PATH);

        let (tx, rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, tx));

        tracing::debug!(%redirect_uri, "callback listener bound");

        Ok(Self {
            accept_task,
            receiver: rx,
            redirect_uri,
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Race the first callback against `timeout`. The listener is torn
    /// down on all paths.
    pub async fn wait(self, timeout: Duration) -> Result<CallbackParams, AuthError> {
        let result = tokio::select! {
            received = self.receiver => {
                received.map_err(|_| AuthError::Callback("listener stopped early".to_string()))
            }
            _ = tokio::time::sleep(timeout) => Err(AuthError::Timeout(timeout)),
        };
        self.accept_task.abort();
        result
    }
}

async fn accept_loop(listener: TcpListener, tx: oneshot::Sender<CallbackParams>) {
    let mut tx = Some(tx);
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "callback accept failed");
                continue;
            }
        };
        if let Some(params) = handle_connection(stream).await {
            // Only the first callback counts. Later hits still saw the
            // success page inside handle_connection.
            if let Some(tx) = tx.take() {
                let _ = tx.send(params);
            }
        }
    }
}

/// Read one HTTP request, answer with the success page, and extract the
/// query parameters if the path matches the redirect path.
async fn handle_connection(mut stream: TcpStream) -> Option<CallbackParams> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.ok()?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let request_line = request.lines().next()?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path_and_query = parts.next()?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        SUCCESS_PAGE.len(),
        SUCCESS_PAGE
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    if method != "GET" || !path_and_query.starts_with(CALLBACK_PATH) {
        return None;
    }
    Some(parse_query(path_and_query))
}

fn parse_query(path_and_query: &str) -> CallbackParams {
    let mut params = CallbackParams {
        code: None,
        state: None,
        error: None,
    };
    // A relative path needs a base to parse as a URL.
    if let Ok(url) = url::Url::parse(&format!("http://127.0.0.1{}", path_and_query)) {
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
    }
    params
}
