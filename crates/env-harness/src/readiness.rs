//! Readiness gating for freshly installed namespaces.

use crate::eventual::{eventually, EventuallyError, PollPolicy};
use crate::process::{Invocation, ProcessSupervisor};
use async_trait::async_trait;
use common::error::{HarnessError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, instrument};

/// Readiness of a single pod as last reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodReadiness {
    pub name: String,
    pub ready: bool,
}

/// Source of pod readiness for a namespace.
#[async_trait]
pub trait PodStatusSource: Send + Sync {
    /// Current readiness of every pod in `namespace`.
    async fn pod_readiness(&self, namespace: &str) -> Result<Vec<PodReadiness>>;
}

/// Reads pod status with `kubectl get pods -o json`.
#[derive(Debug, Clone)]
pub struct KubectlPods {
    supervisor: ProcessSupervisor,
    kubectl: Invocation,
    request_timeout: Duration,
}

impl KubectlPods {
    /// `request_timeout` caps each API request kubectl makes.
    pub fn new(supervisor: ProcessSupervisor, kubectl: Invocation, request_timeout: Duration) -> Self {
        Self {
            supervisor,
            kubectl,
            request_timeout,
        }
    }

    fn invocation(&self, namespace: &str) -> Invocation {
        // kubectl rejects sub-second values; zero would mean no limit.
        let seconds = self.request_timeout.as_secs().max(1);
        self.kubectl.clone().args([
            "get".to_string(),
            "pods".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--output".to_string(),
            "json".to_string(),
            format!("--request-timeout={seconds}s"),
        ])
    }
}

#[async_trait]
impl PodStatusSource for KubectlPods {
    async fn pod_readiness(&self, namespace: &str) -> Result<Vec<PodReadiness>> {
        let output = self.supervisor.run(&self.invocation(namespace)).await?;
        parse_pod_list(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    type_: String,
    status: String,
}

impl Pod {
    fn is_ready(&self) -> bool {
        // Completed job pods never report Ready but are not blocking.
        if self.status.phase.as_deref() == Some("Succeeded") {
            return true;
        }
        self.status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    }
}

/// Parse `kubectl get pods -o json` output.
pub fn parse_pod_list(json: &str) -> Result<Vec<PodReadiness>> {
    let list: PodList = serde_json::from_str(json)?;
    Ok(list
        .items
        .into_iter()
        .map(|pod| PodReadiness {
            ready: pod.is_ready(),
            name: pod.metadata.name,
        })
        .collect())
}

/// At least one pod, and every observed pod ready.
fn all_ready(pods: &[PodReadiness]) -> bool {
    !pods.is_empty() && pods.iter().all(|p| p.ready)
}

/// Block until every pod in `namespace` is ready.
///
/// Errors from the status source (for example the namespace not existing
/// yet right after install) count as "not ready". Only non-retryable errors
/// such as a missing kubectl binary abort the wait early.
///
/// # Errors
///
/// `ReadinessTimeout` naming the pods still not ready at the deadline.
#[instrument(skip(source), fields(timeout = ?policy.timeout))]
pub async fn wait_all_ready(
    source: &dyn PodStatusSource,
    namespace: &str,
    policy: PollPolicy,
) -> Result<()> {
    let result = eventually(
        move || async move { source.pod_readiness(namespace).await },
        |pods: &Vec<PodReadiness>| all_ready(pods),
        policy,
    )
    .await;

    match result {
        Ok(pods) => {
            info!(
                target: "env.readiness",
                namespace,
                pods = pods.len(),
                "All pods ready"
            );
            Ok(())
        }
        Err(EventuallyError::Timeout { last_value, .. }) => {
            let not_ready = last_value
                .unwrap_or_default()
                .into_iter()
                .filter(|p| !p.ready)
                .map(|p| p.name)
                .collect();
            Err(HarnessError::ReadinessTimeout {
                namespace: namespace.to_string(),
                timeout: policy.timeout,
                not_ready,
            })
        }
        Err(EventuallyError::Aborted(err)) => Err(err),
    }
}
