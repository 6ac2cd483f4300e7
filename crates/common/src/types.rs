//! Data model shared by the harness components.

use crate::error::{HarnessError, Result};
use crate::secret::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Helm refuses release names longer than this.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

/// Name of a helm release and the namespace it lives in.
///
/// Generated once per scenario instance and never reused. Uniqueness comes
/// from the seed/slot pair: two scenarios sharing a seed always hold
/// different slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ReleaseIdentity {
    name: String,
    namespace: String,
}

impl ReleaseIdentity {
    /// Build `"{prefix}-{seed}-{slot}"`; the namespace shares the name.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Configuration` if the result is not a valid
    /// DNS-1123 label or exceeds [`MAX_RELEASE_NAME_LEN`].
    pub fn generate(prefix: &str, seed: u64, slot: u32) -> Result<Self> {
        let name = format!("{prefix}-{seed}-{slot}");
        validate_dns_label(&name)?;
        Ok(Self {
            namespace: name.clone(),
            name,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for ReleaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn validate_dns_label(name: &str) -> Result<()> {
    if name.len() > MAX_RELEASE_NAME_LEN {
        return Err(HarnessError::Configuration(format!(
            "release name '{name}' exceeds {MAX_RELEASE_NAME_LEN} characters"
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = name.starts_with(|c: char| c.is_ascii_lowercase());
    let ends_ok = name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());

    if !(valid_chars && starts_ok && ends_ok) {
        return Err(HarnessError::Configuration(format!(
            "release name '{name}' is not a valid DNS-1123 label"
        )));
    }

    Ok(())
}

/// Ordered `key=value` overrides handed to the chart installer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentParameters {
    overrides: Vec<(String, String)>,
}

impl DeploymentParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an override. Order is preserved; later keys win in helm.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Web node garbage-collection interval, e.g. `"300ms"`.
    #[must_use]
    pub fn gc_interval(self, interval: &str) -> Self {
        self.set("concourse.web.gc.interval", interval)
    }

    /// Worker heartbeat interval as seen by the web node, e.g. `"300ms"`.
    #[must_use]
    pub fn heartbeat_interval(self, interval: &str) -> Self {
        self.set("concourse.web.tsa.heartbeatInterval", interval)
    }

    #[must_use]
    pub fn worker_replicas(self, replicas: u32) -> Self {
        self.set("worker.replicas", replicas.to_string())
    }

    /// Worker volume driver, e.g. `"overlay"`.
    #[must_use]
    pub fn worker_storage_driver(self, driver: &str) -> Self {
        self.set("concourse.worker.baggageclaim.driver", driver)
    }

    /// Render as `--set=key=value` arguments, in insertion order.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        self.overrides
            .iter()
            .map(|(key, value)| format!("--set={key}={value}"))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

/// Registration state a worker reports to the web node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Running,
    Stalled,
    Landing,
    Landed,
    Retiring,
    #[serde(other)]
    Other,
}

/// Read-only view of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub state: WorkerState,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub active_containers: u32,
}

impl Worker {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }
}

/// Keep only the workers in the `running` state.
#[must_use]
pub fn running_workers(workers: Vec<Worker>) -> Vec<Worker> {
    workers.into_iter().filter(Worker::is_running).collect()
}

/// Opaque authenticated capability for the system under test.
///
/// The token is redacted in `Debug` output.
#[derive(Debug, Clone)]
pub struct Session {
    endpoint: String,
    token: SecretString,
}

impl Session {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, token: SecretString) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_combines_prefix_seed_and_slot() {
        let id = ReleaseIdentity::generate("topgun-ew", 1_700_000, 3).unwrap();
        assert_eq!(id.name(), "topgun-ew-1700000-3");
        assert_eq!(id.namespace(), id.name());
    }

    #[test]
    fn test_identity_rejects_uppercase_prefix() {
        let err = ReleaseIdentity::generate("TopGun", 1, 1).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
    }

    #[test]
    fn test_identity_rejects_overlong_name() {
        let prefix = "a".repeat(50);
        let err = ReleaseIdentity::generate(&prefix, 12345, 1).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_identity_rejects_leading_digit() {
        assert!(ReleaseIdentity::generate("1abc", 1, 1).is_err());
    }

    #[test]
    fn test_parameters_render_in_order() {
        let params = DeploymentParameters::new()
            .gc_interval("300ms")
            .heartbeat_interval("300ms")
            .worker_replicas(1)
            .worker_storage_driver("overlay");

        assert_eq!(
            params.to_args(),
            vec![
                "--set=concourse.web.gc.interval=300ms",
                "--set=concourse.web.tsa.heartbeatInterval=300ms",
                "--set=worker.replicas=1",
                "--set=concourse.worker.baggageclaim.driver=overlay",
            ]
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_worker_unknown_state_maps_to_other() {
        let json = r#"{"name": "w1", "state": "hibernating"}"#;
        let worker: Worker = serde_json::from_str(json).unwrap();
        assert_eq!(worker.state, WorkerState::Other);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_running_workers_filters_by_state() {
        let workers: Vec<Worker> = serde_json::from_str(
            r#"[
                {"name": "a", "state": "running", "platform": "linux"},
                {"name": "b", "state": "stalled"},
                {"name": "c", "state": "retiring"},
                {"name": "d", "state": "running", "active_containers": 4}
            ]"#,
        )
        .unwrap();

        let running = running_workers(workers);
        let names: Vec<&str> = running.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = Session::new("http://127.0.0.1:1234", SecretString::from("tok-abc"));
        let debug = format!("{session:?}");
        assert!(debug.contains("127.0.0.1:1234"));
        assert!(!debug.contains("tok-abc"));
    }
}
