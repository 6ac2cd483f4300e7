//! Harness configuration.
//!
//! Configuration is loaded from environment variables. The login password is
//! held as a [`SecretString`] and redacted in Debug output.

use crate::error::HarnessError;
use crate::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default prefix for release and namespace names.
pub const DEFAULT_RELEASE_PREFIX: &str = "topgun-ew";

/// Default readiness deadline in seconds.
pub const DEFAULT_READINESS_TIMEOUT_SECONDS: u64 = 600;

/// Default pod status polling interval in seconds.
pub const DEFAULT_READINESS_INTERVAL_SECONDS: u64 = 2;

/// Default port-forward confirmation deadline in seconds.
pub const DEFAULT_PROXY_TIMEOUT_SECONDS: u64 = 30;

/// Default worker registration polling interval in seconds.
pub const DEFAULT_WORKER_POLL_INTERVAL_SECONDS: u64 = 10;

/// Default worker registration deadline in seconds.
pub const DEFAULT_WORKER_POLL_TIMEOUT_SECONDS: u64 = 120;

/// Default in-cluster port of the web service.
pub const DEFAULT_WEB_PORT: u16 = 8080;

/// Harness configuration.
///
/// Loaded from environment variables with sensible defaults. Only the chart
/// location is required.
#[derive(Clone)]
pub struct HarnessConfig {
    /// Chart reference or local chart directory passed to `helm install`.
    pub chart: String,

    /// Prefix for generated release/namespace names (default: "topgun-ew").
    pub release_prefix: String,

    /// Randomization seed shared by all scenarios of one test run.
    pub random_seed: u64,

    /// 1-based index of this test process among parallel processes.
    pub parallel_node: u32,

    /// Number of parallel test processes sharing the seed.
    pub parallel_total: u32,

    /// Installer binary (default: "helm").
    pub helm_bin: String,

    /// Cluster CLI binary (default: "kubectl").
    pub kubectl_bin: String,

    /// Forwarded to every tool invocation when set.
    pub kubeconfig: Option<String>,

    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    pub proxy_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub worker_poll_timeout: Duration,

    /// Login user for the deployed web node.
    pub username: String,

    /// Login password for the deployed web node.
    pub password: SecretString,

    /// In-cluster port of the `<release>-web` service.
    pub web_port: u16,

    /// Optional image override appended as `--set=image=...`.
    pub image: Option<String>,

    /// Optional image tag override appended as `--set=imageTag=...`.
    pub image_tag: Option<String>,
}

impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("chart", &self.chart)
            .field("release_prefix", &self.release_prefix)
            .field("random_seed", &self.random_seed)
            .field("parallel_node", &self.parallel_node)
            .field("parallel_total", &self.parallel_total)
            .field("helm_bin", &self.helm_bin)
            .field("kubectl_bin", &self.kubectl_bin)
            .field("kubeconfig", &self.kubeconfig)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("readiness_interval", &self.readiness_interval)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("worker_poll_interval", &self.worker_poll_interval)
            .field("worker_poll_timeout", &self.worker_poll_timeout)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("web_port", &self.web_port)
            .field("image", &self.image)
            .field("image_tag", &self.image_tag)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

impl From<ConfigError> for HarnessError {
    fn from(err: ConfigError) -> Self {
        HarnessError::Configuration(err.to_string())
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let chart = vars
            .get("HARNESS_CHART")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("HARNESS_CHART".to_string()))?
            .clone();

        let release_prefix = string_or(vars, "HARNESS_RELEASE_PREFIX", DEFAULT_RELEASE_PREFIX);

        let random_seed = match vars.get("HARNESS_RANDOM_SEED") {
            Some(value) => value.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                var: "HARNESS_RANDOM_SEED".to_string(),
                reason: format!("must be an unsigned integer, got '{value}': {e}"),
            })?,
            // Keep generated names short; helm caps release names at 53 chars.
            None => u64::from(rand::random::<u32>()),
        };

        let parallel_node = parse_positive::<u32>(vars, "HARNESS_PARALLEL_NODE", 1)?;
        let parallel_total = parse_positive::<u32>(vars, "HARNESS_PARALLEL_TOTAL", 1)?;
        if parallel_node > parallel_total {
            return Err(ConfigError::InvalidValue {
                var: "HARNESS_PARALLEL_NODE".to_string(),
                reason: format!(
                    "node {parallel_node} exceeds HARNESS_PARALLEL_TOTAL {parallel_total}"
                ),
            });
        }

        let readiness_timeout = parse_seconds(
            vars,
            "HARNESS_READINESS_TIMEOUT_SECONDS",
            DEFAULT_READINESS_TIMEOUT_SECONDS,
        )?;
        let readiness_interval = parse_seconds(
            vars,
            "HARNESS_READINESS_INTERVAL_SECONDS",
            DEFAULT_READINESS_INTERVAL_SECONDS,
        )?;
        ensure_interval_below_timeout(
            "HARNESS_READINESS_INTERVAL_SECONDS",
            readiness_interval,
            readiness_timeout,
        )?;

        let proxy_timeout = parse_seconds(
            vars,
            "HARNESS_PROXY_TIMEOUT_SECONDS",
            DEFAULT_PROXY_TIMEOUT_SECONDS,
        )?;

        let worker_poll_interval = parse_seconds(
            vars,
            "HARNESS_WORKER_POLL_INTERVAL_SECONDS",
            DEFAULT_WORKER_POLL_INTERVAL_SECONDS,
        )?;
        let worker_poll_timeout = parse_seconds(
            vars,
            "HARNESS_WORKER_POLL_TIMEOUT_SECONDS",
            DEFAULT_WORKER_POLL_TIMEOUT_SECONDS,
        )?;
        ensure_interval_below_timeout(
            "HARNESS_WORKER_POLL_INTERVAL_SECONDS",
            worker_poll_interval,
            worker_poll_timeout,
        )?;

        let web_port = parse_positive::<u16>(vars, "HARNESS_WEB_PORT", DEFAULT_WEB_PORT)?;

        Ok(Self {
            chart,
            release_prefix,
            random_seed,
            parallel_node,
            parallel_total,
            helm_bin: string_or(vars, "HARNESS_HELM_BIN", "helm"),
            kubectl_bin: string_or(vars, "HARNESS_KUBECTL_BIN", "kubectl"),
            kubeconfig: optional(vars, "KUBECONFIG"),
            readiness_timeout,
            readiness_interval,
            proxy_timeout,
            worker_poll_interval,
            worker_poll_timeout,
            username: string_or(vars, "HARNESS_USERNAME", "test"),
            password: SecretString::from(string_or(vars, "HARNESS_PASSWORD", "test")),
            web_port,
            image: optional(vars, "HARNESS_IMAGE"),
            image_tag: optional(vars, "HARNESS_IMAGE_TAG"),
        })
    }
}

fn string_or(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    optional(vars, key).unwrap_or_else(|| default.to_string())
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_positive<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = value_str.parse().map_err(|e| ConfigError::InvalidValue {
        var: key.to_string(),
        reason: format!("must be a valid positive integer, got '{value_str}': {e}"),
    })?;

    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var: key.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }

    Ok(value)
}

fn parse_seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_positive::<u64>(vars, key, default).map(Duration::from_secs)
}

fn ensure_interval_below_timeout(
    key: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ConfigError> {
    if interval >= timeout {
        return Err(ConfigError::InvalidValue {
            var: key.to_string(),
            reason: format!("interval {interval:?} must be shorter than timeout {timeout:?}"),
        });
    }
    Ok(())
}
