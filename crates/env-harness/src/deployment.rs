//! Release installation and teardown.
//!
//! [`HelmReleases`] installs one uniquely named release per scenario into a
//! namespace of the same name, seeds auxiliary config maps into it, and
//! later removes both the release and the namespace.

use crate::process::{Invocation, ProcessSupervisor};
use async_trait::async_trait;
use common::error::{HarnessError, Result};
use common::types::{DeploymentParameters, ReleaseIdentity};
use tracing::{info, instrument, warn};

/// Install/seed/uninstall operations the scenario controller depends on.
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Install the chart as `identity` with the given overrides.
    async fn install(
        &self,
        identity: &ReleaseIdentity,
        parameters: &DeploymentParameters,
    ) -> Result<()>;

    /// Create config map `key` holding `key=value` in the release namespace.
    async fn seed_config(&self, identity: &ReleaseIdentity, key: &str, value: &str) -> Result<()>;

    /// Remove the release and request namespace deletion. Both steps are
    /// always attempted; the first failure is returned.
    async fn uninstall(&self, identity: &ReleaseIdentity) -> Result<()>;
}

/// Chart lifecycle through the `helm` and `kubectl` CLIs.
#[derive(Debug, Clone)]
pub struct HelmReleases {
    supervisor: ProcessSupervisor,
    helm: Invocation,
    kubectl: Invocation,
    chart: String,
}

impl HelmReleases {
    pub fn new(
        supervisor: ProcessSupervisor,
        helm: Invocation,
        kubectl: Invocation,
        chart: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            helm,
            kubectl,
            chart: chart.into(),
        }
    }

    fn install_invocation(
        &self,
        identity: &ReleaseIdentity,
        parameters: &DeploymentParameters,
    ) -> Invocation {
        self.helm
            .clone()
            .args([
                "install",
                identity.name(),
                self.chart.as_str(),
                "--namespace",
                identity.namespace(),
                "--create-namespace",
            ])
            .args(parameters.to_args())
    }

    fn seed_invocation(&self, identity: &ReleaseIdentity, key: &str, value: &str) -> Invocation {
        self.kubectl.clone().args([
            "create".to_string(),
            "configmap".to_string(),
            key.to_string(),
            format!("--namespace={}", identity.namespace()),
            format!("--from-literal={key}={value}"),
        ])
    }

    fn helm_uninstall_invocation(&self, identity: &ReleaseIdentity) -> Invocation {
        self.helm.clone().args([
            "uninstall",
            identity.name(),
            "--namespace",
            identity.namespace(),
        ])
    }

    fn delete_namespace_invocation(&self, identity: &ReleaseIdentity) -> Invocation {
        self.kubectl
            .clone()
            .args(["delete", "namespace", identity.namespace(), "--wait=false"])
    }
}

#[async_trait]
impl ReleaseManager for HelmReleases {
    #[instrument(skip_all, fields(release = %identity.name(), overrides = parameters.len()))]
    async fn install(
        &self,
        identity: &ReleaseIdentity,
        parameters: &DeploymentParameters,
    ) -> Result<()> {
        let invocation = self.install_invocation(identity, parameters);

        match self.supervisor.run(&invocation).await {
            Ok(_) => {
                info!(target: "env.deployment", release = %identity, "Release installed");
                Ok(())
            }
            Err(HarnessError::ExitFailure { output, .. }) => {
                Err(HarnessError::DeploymentFailed {
                    release: identity.name().to_string(),
                    output,
                })
            }
            Err(other) => Err(other),
        }
    }

    #[instrument(skip_all, fields(release = %identity.name(), key = %key))]
    async fn seed_config(&self, identity: &ReleaseIdentity, key: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            info!(target: "env.deployment", key, "Seeding empty config value");
        }
        self.supervisor
            .run(&self.seed_invocation(identity, key, value))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(release = %identity.name()))]
    async fn uninstall(&self, identity: &ReleaseIdentity) -> Result<()> {
        let helm_result = self
            .supervisor
            .run(&self.helm_uninstall_invocation(identity))
            .await;
        if let Err(e) = &helm_result {
            warn!(target: "env.deployment", release = %identity, error = %e, "helm uninstall failed");
        }

        // Namespace deletion runs regardless; it also sweeps anything helm left.
        let namespace_result = self
            .supervisor
            .run(&self.delete_namespace_invocation(identity))
            .await;
        if let Err(e) = &namespace_result {
            warn!(target: "env.deployment", release = %identity, error = %e, "Namespace deletion failed");
        }

        if helm_result.is_ok() && namespace_result.is_ok() {
            info!(target: "env.deployment", release = %identity, "Release uninstalled, namespace deletion requested");
        }

        helm_result.and(namespace_result).map(|_| ())
    }
}
