//! OAuth 2.0 authorization for remote servers
//!
//! Authorization-code flow with PKCE (S256) and dynamic client
//! registration (RFC 7591). Endpoints come from RFC 9728 protected
//! resource metadata when the server publishes it, falling back to RFC
//! 8414 authorization-server metadata at the server origin. The flow is
//! only engaged for HTTP/SSE targets when no token was supplied.

pub mod callback;
pub mod pkce;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use callback::{CallbackListener, CallbackParams};
pub use pkce::PkcePair;

/// Whole-flow budget: registration, browser round trip, token exchange.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization server discovery failed: {0}")]
    Discovery(String),

    #[error("dynamic client registration failed: {0}")]
    Registration(String),

    #[error("callback listener failed: {0}")]
    Callback(String),

    #[error("authorization timed out after {0:?}")]
    Timeout(Duration),

    #[error("state parameter in callback does not match the one issued")]
    StateMismatch,

    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl AuthError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AuthError::Timeout(_))
    }
}

/// RFC 8414 authorization server metadata, the fields we use
#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

/// RFC 9728 protected resource metadata, the fields we use
#[derive(Debug, Clone, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Registered client credentials. The secret is optional: public clients
/// registered with `token_endpoint_auth_method: none` have none.
#[derive(Clone, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Bearer token from a completed flow
#[derive(Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl AccessToken {
    /// First and last four characters, for logs and reports.
    pub fn masked(&self) -> String {
        mask_secret(&self.access_token)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &self.masked())
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Keep the first and last four characters visible, never more than half
/// the value.
pub fn mask_secret(value: &str) -> String {
    if value.len() <= 8 {
        return "****".to_string();
    }
    format!("{}...{}", &value[..4], &value[value.len() - 4..])
}

/// Settings for one authorization attempt
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Pre-registered client, skips dynamic registration when set
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Scope to request, if any
    pub scope: Option<String>,
    /// Skip launching a browser (URL is still printed)
    pub no_browser: bool,
}

#[derive(Serialize)]
struct RegistrationRequest<'a> {
    client_name: &'a str,
    redirect_uris: Vec<&'a str>,
    grant_types: Vec<&'a str>,
    response_types: Vec<&'a str>,
    token_endpoint_auth_method: &'a str,
}

/// Drives one complete authorization-code flow.
pub struct OAuthFlow {
    http: reqwest::Client,
    server_url: url::Url,
    config: AuthConfig,
}

impl OAuthFlow {
    pub fn new(server_url: &str, config: AuthConfig) -> Result<Self, AuthError> {
        let server_url = url::Url::parse(server_url)
            .map_err(|e| AuthError::Discovery(format!("invalid server URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            server_url,
            config,
        })
    }

    /// Run the whole flow and return a bearer token.
    pub async fn acquire_token(&self) -> Result<AccessToken, AuthError> {
        let metadata = self.discover().await?;
        tracing::info!(
            authorize = %metadata.authorization_endpoint,
            token = %metadata.token_endpoint,
            "discovered authorization server"
        );

        let listener = CallbackListener::bind().await?;
        let redirect_uri = listener.redirect_uri().to_string();

        let credentials = self.client_credentials(&metadata, &redirect_uri).await?;
        let pkce = PkcePair::generate();
        let state = pkce::generate_state();

        let authorize_url =
            self.build_authorize_url(&metadata, &credentials, &redirect_uri, &pkce, &state)?;

        tracing::info!("waiting for authorization in the browser");
        eprintln!("Open this URL to authorize:\n  {}", authorize_url);
        if !self.config.no_browser {
            open_in_browser(authorize_url.as_str()).await;
        }

        let params = listener.wait(AUTH_TIMEOUT).await?;

        if let Some(error) = params.error {
            return Err(AuthError::Denied(error));
        }
        // A forged or replayed redirect carries the wrong state; the code
        // it carries must never reach the token endpoint.
        if params.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        let code = params
            .code
            .ok_or_else(|| AuthError::Callback("callback carried no code".to_string()))?;

        let token = self
            .exchange_code(&metadata, &credentials, &redirect_uri, &pkce, &code)
            .await?;
        tracing::info!(token = %token.masked(), "obtained access token");
        Ok(token)
    }

    /// Find the authorization server. Prefer the protected-resource
    /// document, fall back to server-origin metadata.
    async fn discover(&self) -> Result<AuthServerMetadata, AuthError> {
        let origin = origin_of(&self.server_url);

        let resource_url = format!("{}/.well-known/oauth-protected-resource", origin);
        if let Ok(response) = self.http.get(&resource_url).send().await {
            if response.status().is_success() {
                if let Ok(meta) = response.json::<ProtectedResourceMetadata>().await {
                    if let Some(auth_server) = meta.authorization_servers.first() {
                        return self.fetch_server_metadata(auth_server.trim_end_matches('/')).await;
                    }
                }
            }
        }

        self.fetch_server_metadata(&origin).await
    }

    async fn fetch_server_metadata(&self, base: &str) -> Result<AuthServerMetadata, AuthError> {
        let url = format!("{}/.well-known/oauth-authorization-server", base);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Discovery(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        response
            .json::<AuthServerMetadata>()
            .await
            .map_err(|e| AuthError::Discovery(format!("invalid metadata document: {}", e)))
    }

    async fn client_credentials(
        &self,
        metadata: &AuthServerMetadata,
        redirect_uri: &str,
    ) -> Result<ClientCredentials, AuthError> {
        if let Some(client_id) = &self.config.client_id {
            return Ok(ClientCredentials {
                client_id: client_id.clone(),
                client_secret: self.config.client_secret.clone(),
            });
        }

        let endpoint = metadata.registration_endpoint.as_ref().ok_or_else(|| {
            AuthError::Registration(
                "no client id supplied and the server offers no registration endpoint".to_string(),
            )
        })?;

        let request = RegistrationRequest {
            client_name: env!("CARGO_PKG_NAME"),
            redirect_uris: vec![redirect_uri],
            grant_types: vec!["authorization_code"],
            response_types: vec!["code"],
            token_endpoint_auth_method: "none",
        };

        let response = self.http.post(endpoint).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::Registration(format!(
                "registration endpoint returned HTTP {}",
                response.status()
            )));
        }
        let credentials: ClientCredentials = response
            .json()
            .await
            .map_err(|e| AuthError::Registration(format!("invalid registration response: {}", e)))?;
        tracing::info!(client_id = %credentials.client_id, "registered client");
        Ok(credentials)
    }

    fn build_authorize_url(
        &self,
        metadata: &AuthServerMetadata,
        credentials: &ClientCredentials,
        redirect_uri: &str,
        pkce: &PkcePair,
        state: &str,
    ) -> Result<url::Url, AuthError> {
        let mut url = url::Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| AuthError::Discovery(format!("invalid authorization endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &credentials.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        if let Some(scope) = &self.config.scope {
            url.query_pairs_mut().append_pair("scope", scope);
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        metadata: &AuthServerMetadata,
        credentials: &ClientCredentials,
        redirect_uri: &str,
        pkce: &PkcePair,
        code: &str,
    ) -> Result<AccessToken, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", credentials.client_id.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        if let Some(secret) = &credentials.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchange(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        response
            .json::<AccessToken>()
            .await
            .map_err(|e| AuthError::TokenExchange(format!("invalid token response: {}", e)))
    }
}

fn origin_of(url: &url::Url) -> String {
    let mut origin = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or("localhost")
    );
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{}", port));
    }
    origin
}

/// Launch the platform browser opener if one exists. Failure is fine, the
/// URL was already printed.
async fn open_in_browser(url: &str) {
    for opener in ["xdg-open", "open"] {
        if which::which(opener).is_ok() {
            let result = tokio::process::Command::new(opener)
                .arg(url)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
            match result {
                Ok(_) => return,
                Err(e) => tracing::debug!(opener, error = %e, "browser launch failed"),
            }
        }
    }
    tracing::debug!("no browser opener found");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_only_edges() {
        assert_eq!(mask_secret("abcdefghijklmnop"), "abcd...mnop");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret(""), "****");
    }

    #[test]
    fn access_token_debug_is_masked() {
        let token = AccessToken {
            access_token: "super-secret-token-value".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: Some(3600),
            refresh_token: Some("refresh-secret".to_string()),
        };
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("super-secret-token-value"));
        assert!(!rendered.contains("refresh-secret"));
        assert!(rendered.contains("supe...alue"));
    }

    #[test]
    fn client_credentials_debug_hides_secret() {
        let creds = ClientCredentials {
            client_id: "client-1".to_string(),
            client_secret: Some("hunter2-but-longer".to_string()),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("client-1"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn token_response_defaults() {
        let token: AccessToken =
            serde_json::from_str(r#"{"access_token":"abc12345xyz"}"#).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert!(token.expires_in.is_none());
    }

    #[test]
    fn origin_strips_path_and_keeps_port() {
        let url = url::Url::parse("https://example.com:8443/mcp/v1").unwrap();
        assert_eq!(origin_of(&url), "https://example.com:8443");
        let url = url::Url::parse("https://example.com/mcp").unwrap();
        assert_eq!(origin_of(&url), "https://example.com");
    }

    #[test]
    fn authorize_url_carries_pkce_and_state() {
        let flow = OAuthFlow::new("https://example.com/mcp", AuthConfig::default()).unwrap();
        let metadata = AuthServerMetadata {
            authorization_endpoint: "https://example.com/authorize".to_string(),
            token_endpoint: "https://example.com/token".to_string(),
            registration_endpoint: None,
        };
        let credentials = ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: None,
        };
        let pkce = PkcePair::generate();
        let url = flow
            .build_authorize_url(
                &metadata,
                &credentials,
                "http://127.0.0.1:8765/callback",
                &pkce,
                "the-state",
            )
            .unwrap();

        let query: std::collections::HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "cid");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["code_challenge"], pkce.challenge.as_str());
        assert_eq!(query["state"], "the-state");
        assert!(!url.as_str().contains(&pkce.verifier));
    }

    #[test]
    fn metadata_parses_without_registration_endpoint() {
        let meta: AuthServerMetadata = serde_json::from_str(
            r#"{"authorization_endpoint":"https://a/auth","token_endpoint":"https://a/token"}"#,
        )
        .unwrap();
        assert!(meta.registration_endpoint.is_none());
    }
}
