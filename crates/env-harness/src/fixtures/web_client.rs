//! Web API client for the deployed CI system.
//!
//! Logs in with the password grant the `fly` CLI uses and lists registered
//! workers. The access token only ever lives inside a [`Session`].

use async_trait::async_trait;
use common::error::{HarnessError, Result};
use common::secret::{ExposeSecret, SecretString};
use common::types::{Session, Worker};
use regex::Regex;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// OAuth client the web node pre-registers for the CLI.
const CLI_CLIENT_ID: &str = "fly";
const CLI_CLIENT_SECRET: &str = "Zmx5";

const LOGIN_SCOPE: &str = "openid profile email federated:id groups";

/// Maximum length for error body in error messages.
const MAX_ERROR_BODY_LEN: usize = 256;

/// JWT tokens (header.payload.signature).
#[allow(clippy::expect_used)] // Constant pattern.
static JWT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+(?:\.[A-Za-z0-9_-]*)?")
        .expect("JWT pattern is valid")
});

/// Bearer tokens in text, opaque or JWT.
#[allow(clippy::expect_used)] // Constant pattern.
static BEARER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/-]+=*").expect("bearer pattern is valid")
});

/// Redact credentials from an error body and cap its length.
fn sanitize_error_body(body: &str) -> String {
    // Bearer first so "Bearer <JWT>" is redacted as a whole.
    let sanitized = BEARER_PATTERN.replace_all(body, "[BEARER_REDACTED]");
    let sanitized = JWT_PATTERN.replace_all(&sanitized, "[JWT_REDACTED]");

    if sanitized.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = sanitized.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{head}...[truncated]")
    } else {
        sanitized.into_owned()
    }
}

/// Operations the scenario needs from the system under test.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Authenticate against `endpoint` and return a session bound to it.
    async fn login(
        &self,
        username: &str,
        password: &SecretString,
        endpoint: &str,
    ) -> Result<Session>;

    /// Every worker currently registered, in any state.
    async fn list_workers(&self, session: &Session) -> Result<Vec<Worker>>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// HTTP implementation of [`WorkerApi`].
#[derive(Debug, Clone)]
pub struct WebClient {
    http_client: Client,
}

impl WebClient {
    /// # Errors
    ///
    /// `Configuration` if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    /// # Errors
    ///
    /// `Configuration` if the HTTP client cannot be built.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| HarnessError::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http_client })
    }

    async fn error_body(response: Response) -> String {
        let body = response.text().await.unwrap_or_else(|e| {
            debug!(target: "env.web_client", error = %e, "Failed to read error response body");
            String::new()
        });
        sanitize_error_body(&body)
    }
}

#[async_trait]
impl WorkerApi for WebClient {
    #[instrument(skip(self, password), err)]
    async fn login(
        &self,
        username: &str,
        password: &SecretString,
        endpoint: &str,
    ) -> Result<Session> {
        let url = format!("{}/sky/issuer/token", endpoint.trim_end_matches('/'));

        let form_body = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password.expose_secret()),
            ("scope", LOGIN_SCOPE),
        ];

        // An unreachable endpoint is a failed login, not a transient fault.
        let response = self
            .http_client
            .post(&url)
            .basic_auth(CLI_CLIENT_ID, Some(CLI_CLIENT_SECRET))
            .form(&form_body)
            .send()
            .await
            .map_err(|e| HarnessError::AuthenticationFailed(format!("{url} unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = Self::error_body(response).await;
            warn!(target: "env.web_client", status = %status, "Login rejected");
            return Err(HarnessError::AuthenticationFailed(format!(
                "login as '{username}' returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        debug!(target: "env.web_client", "Login succeeded");

        Ok(Session::new(
            endpoint.trim_end_matches('/'),
            SecretString::from(token.access_token),
        ))
    }

    #[instrument(skip_all, fields(endpoint = %session.endpoint()))]
    async fn list_workers(&self, session: &Session) -> Result<Vec<Worker>> {
        let url = format!("{}/api/v1/workers", session.endpoint());

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(session.token().expose_secret())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = Self::error_body(response).await;
            return Err(HarnessError::AuthenticationFailed(format!(
                "worker listing returned {status}: {body}"
            )));
        }
        if !status.is_success() {
            return Err(HarnessError::RequestFailed {
                status: status.as_u16(),
                body: Self::error_body(response).await,
            });
        }

        let workers: Vec<Worker> = response.json().await?;
        debug!(target: "env.web_client", count = workers.len(), "Listed workers");
        Ok(workers)
    }
}
