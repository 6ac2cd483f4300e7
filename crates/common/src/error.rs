//! Error taxonomy shared by every harness component.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while provisioning, probing, or tearing down an
/// ephemeral environment.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// The external tool could not be started at all (missing binary,
    /// permission denied). Distinct from a tool that ran and failed.
    #[error("Failed to launch '{program}': {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully. `code` is `None` when the
    /// process was terminated by a signal.
    #[error("'{program}' exited with code {code:?}: {output}")]
    ExitFailure {
        program: String,
        code: Option<i32>,
        output: String,
    },

    /// The chart installer rejected the release.
    #[error("Deployment of release '{release}' failed: {output}")]
    DeploymentFailed { release: String, output: String },

    /// Pods in the namespace did not become ready before the deadline.
    #[error("Pods in namespace '{namespace}' not ready after {timeout:?}: {not_ready:?}")]
    ReadinessTimeout {
        namespace: String,
        timeout: Duration,
        not_ready: Vec<String>,
    },

    /// The port-forward never became connectable.
    #[error("Proxy to service '{service}' in namespace '{namespace}' unavailable: {reason}")]
    ProxyUnavailable {
        namespace: String,
        service: String,
        reason: String,
    },

    /// Credentials were rejected or the endpoint could not be reached.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A bounded wait ran out. `last_observed` is the debug rendering of the
    /// final probe result (or probe error) for diagnosis.
    #[error("Condition not met within {timeout:?} after {attempts} attempts; last observed: {last_observed}")]
    ConditionTimeout {
        timeout: Duration,
        attempts: u32,
        last_observed: String,
    },

    /// A single probe of a bounded wait did not complete in time.
    #[error("Probe did not complete within {0:?}")]
    ProbeTimeout(Duration),

    /// Invalid harness configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-success HTTP response from the system under test.
    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed JSON from a tool or API.
    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    /// Whether a bounded poller may retry after this error.
    ///
    /// Authentication failures and missing tools never heal by waiting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            HarnessError::AuthenticationFailed(_)
                | HarnessError::LaunchFailure { .. }
                | HarnessError::Configuration(_)
        )
    }

    /// Short, stable name of the error kind for reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::LaunchFailure { .. } => "LaunchFailure",
            HarnessError::ExitFailure { .. } => "ExitFailure",
            HarnessError::DeploymentFailed { .. } => "DeploymentFailed",
            HarnessError::ReadinessTimeout { .. } => "ReadinessTimeout",
            HarnessError::ProxyUnavailable { .. } => "ProxyUnavailable",
            HarnessError::AuthenticationFailed(_) => "AuthenticationFailed",
            HarnessError::ConditionTimeout { .. } => "ConditionTimeout",
            HarnessError::ProbeTimeout(_) => "ProbeTimeout",
            HarnessError::Configuration(_) => "Configuration",
            HarnessError::RequestFailed { .. } => "RequestFailed",
            HarnessError::Http(_) => "Http",
            HarnessError::Json(_) => "Json",
        }
    }
}

/// Result type alias using `HarnessError`
pub type Result<T> = std::result::Result<T, HarnessError>;
