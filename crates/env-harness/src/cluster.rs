//! Cluster access and tool checks.
//!
//! [`Cluster`] binds a [`HarnessConfig`] to the `helm`/`kubectl` binaries
//! it names, and builds scenarios wired to the real collaborators.

use crate::deployment::HelmReleases;
use crate::fixtures::WebClient;
use crate::identity::process_allocator;
use crate::process::{Invocation, ProcessSupervisor};
use crate::proxy::PortForwarder;
use crate::readiness::KubectlPods;
use crate::scenario::{Collaborators, Scenario, ScenarioPlan};
use common::config::HarnessConfig;
use common::error::Result;
use std::sync::Arc;
use tracing::info;

/// Versions reported by the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub helm: String,
    pub kubectl: String,
}

/// The cluster under test and the tools used to drive it.
#[derive(Debug, Clone)]
pub struct Cluster {
    config: HarnessConfig,
    supervisor: ProcessSupervisor,
    helm: Invocation,
    kubectl: Invocation,
}

impl Cluster {
    pub fn new(config: HarnessConfig) -> Self {
        let helm = Invocation::new(config.helm_bin.clone());
        let kubectl = Invocation::new(config.kubectl_bin.clone());
        Self::with_tools(config, helm, kubectl)
    }

    /// Use explicit base invocations for the tools instead of the
    /// configured binaries.
    pub fn with_tools(config: HarnessConfig, helm: Invocation, kubectl: Invocation) -> Self {
        let mut supervisor = ProcessSupervisor::new();
        if let Some(kubeconfig) = &config.kubeconfig {
            supervisor = supervisor.with_env("KUBECONFIG", kubeconfig.as_str());
        }

        Self {
            config,
            supervisor,
            helm,
            kubectl,
        }
    }

    /// # Errors
    ///
    /// `Configuration` if the environment is missing or has invalid values.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(HarnessConfig::from_env()?))
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Real collaborators backed by helm, kubectl and the web API.
    ///
    /// # Errors
    ///
    /// `Configuration` if the HTTP client cannot be built.
    pub fn collaborators(&self) -> Result<Collaborators> {
        Ok(Collaborators {
            releases: Arc::new(HelmReleases::new(
                self.supervisor.clone(),
                self.helm.clone(),
                self.kubectl.clone(),
                self.config.chart.clone(),
            )),
            pods: Arc::new(KubectlPods::new(
                self.supervisor.clone(),
                self.kubectl.clone(),
                self.config.readiness_interval,
            )),
            forwarder: Arc::new(PortForwarder::new(
                self.supervisor.clone(),
                self.kubectl.clone(),
                self.config.proxy_timeout,
            )),
            web: Arc::new(WebClient::new()?),
        })
    }

    /// A scenario with a fresh process-unique identity.
    ///
    /// # Errors
    ///
    /// `Configuration` if the identity cannot be formed or the HTTP client
    /// cannot be built.
    pub fn scenario(&self, plan: ScenarioPlan) -> Result<Scenario> {
        let identity = process_allocator(&self.config).allocate()?;
        Ok(Scenario::new(identity, plan, self.collaborators()?))
    }

    /// Confirm both tools start and report a version.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` for a missing binary, `ExitFailure` if it errors.
    pub async fn check_tools(&self) -> Result<ToolVersions> {
        let helm = self
            .supervisor
            .run(&self.helm.clone().args(["version", "--short"]))
            .await?;
        let kubectl = self
            .supervisor
            .run(&self.kubectl.clone().args(["version", "--client"]))
            .await?;

        let versions = ToolVersions {
            helm: helm.stdout.trim().to_string(),
            kubectl: kubectl.stdout.trim().to_string(),
        };
        info!(
            target: "env.cluster",
            helm = %versions.helm,
            kubectl = %versions.kubectl,
            "External tools available"
        );
        Ok(versions)
    }

    /// Confirm the API server answers.
    ///
    /// # Errors
    ///
    /// `ExitFailure` with kubectl's output if the cluster is unreachable.
    pub async fn check_reachable(&self) -> Result<()> {
        self.supervisor
            .run(&self.kubectl.clone().args(["cluster-info"]))
            .await?;
        Ok(())
    }
}
