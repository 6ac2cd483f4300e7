//! Scenario lifecycle: provision, verify, run a test body, tear down.
//!
//! A [`Scenario`] walks a fixed, forward-only sequence of states:
//!
//! ```text
//! Idle -> Deploying -> AwaitingReady -> ProxyOpen -> Authenticated
//!      -> Verifying -> Running -> TearingDown -> Done
//! ```
//!
//! Each state is entered before its step runs, so a failure is reported
//! against the state that was in progress. Any failure jumps straight to
//! `TearingDown`. Teardown closes the proxy and then uninstalls the release,
//! attempts both even if one fails, logs its own errors instead of raising
//! them, and runs exactly once. If the scenario future is dropped before
//! teardown, the context schedules the same teardown on the current runtime.
//! Once started, teardown runs on its own task and survives the scenario
//! future being dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use env_harness::cluster::Cluster;
//! use env_harness::scenario::ScenarioPlan;
//!
//! let cluster = Cluster::from_env()?;
//! let plan = ScenarioPlan::external_workers(cluster.config());
//! let outcome = cluster
//!     .scenario(plan)?
//!     .run(|view| async move {
//!         assert!(!view.running_workers().is_empty());
//!         Ok(())
//!     })
//!     .await;
//! outcome.into_result()?;
//! ```

use crate::deployment::ReleaseManager;
use crate::eventual::{eventually, PollPolicy};
use crate::fixtures::WorkerApi;
use crate::proxy::{Forwarder, ProxyLease};
use crate::readiness::{wait_all_ready, PodStatusSource};
use common::config::HarnessConfig;
use common::error::{HarnessError, Result};
use common::secret::SecretString;
use common::types::{running_workers, DeploymentParameters, ReleaseIdentity, Session, Worker};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Config map seeded for external workers before any key exchange exists.
pub const WORKER_PUBLIC_KEY: &str = "worker-public-key";

/// Lifecycle position of one scenario instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioState {
    Idle,
    Deploying,
    AwaitingReady,
    ProxyOpen,
    Authenticated,
    Verifying,
    Running,
    TearingDown,
    Done,
}

impl ScenarioState {
    /// The state after this one on the success path.
    fn successor(self) -> Option<Self> {
        use ScenarioState::{
            AwaitingReady, Authenticated, Deploying, Done, Idle, ProxyOpen, Running, TearingDown,
            Verifying,
        };
        match self {
            Idle => Some(Deploying),
            Deploying => Some(AwaitingReady),
            AwaitingReady => Some(ProxyOpen),
            ProxyOpen => Some(Authenticated),
            Authenticated => Some(Verifying),
            Verifying => Some(Running),
            Running => Some(TearingDown),
            TearingDown => Some(Done),
            Done => None,
        }
    }

    /// Whether `next` is a legal transition from `self`.
    ///
    /// Only the successor is legal, except that any state before
    /// `TearingDown` may jump to it.
    pub fn can_transition_to(self, next: Self) -> bool {
        if next == ScenarioState::TearingDown {
            return !matches!(self, ScenarioState::TearingDown | ScenarioState::Done);
        }
        self.successor() == Some(next)
    }

    pub fn is_terminal(self) -> bool {
        self == ScenarioState::Done
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioState::Idle => "idle",
            ScenarioState::Deploying => "deploying",
            ScenarioState::AwaitingReady => "awaiting-ready",
            ScenarioState::ProxyOpen => "proxy-open",
            ScenarioState::Authenticated => "authenticated",
            ScenarioState::Verifying => "verifying",
            ScenarioState::Running => "running",
            ScenarioState::TearingDown => "tearing-down",
            ScenarioState::Done => "done",
        };
        f.write_str(name)
    }
}

/// A scenario failure, attributed to the state in progress when it occurred.
#[derive(Debug, Error)]
#[error("Scenario '{identity}' failed while {state}: {source}")]
pub struct ScenarioError {
    pub identity: String,
    pub state: ScenarioState,
    #[source]
    pub source: HarnessError,
}

impl ScenarioError {
    /// Short name of the underlying error kind.
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }
}

/// External systems a scenario drives.
#[derive(Clone)]
pub struct Collaborators {
    pub releases: Arc<dyn ReleaseManager>,
    pub pods: Arc<dyn PodStatusSource>,
    pub forwarder: Arc<dyn Forwarder>,
    pub web: Arc<dyn WorkerApi>,
}

/// What to deploy and how long to wait for it.
#[derive(Debug, Clone)]
pub struct ScenarioPlan {
    pub parameters: DeploymentParameters,
    /// Config maps created right after install, in order.
    pub seed_configs: Vec<(String, String)>,
    /// Service name suffix; the forwarded service is `<release>-<suffix>`.
    pub web_service_suffix: String,
    pub web_port: u16,
    pub username: String,
    pub password: SecretString,
    pub readiness: PollPolicy,
    pub workers: PollPolicy,
}

impl ScenarioPlan {
    /// Plan with no chart overrides beyond configured image overrides.
    pub fn from_config(config: &HarnessConfig) -> Self {
        let mut parameters = DeploymentParameters::new();
        if let Some(image) = &config.image {
            parameters = parameters.set("image", image.as_str());
        }
        if let Some(tag) = &config.image_tag {
            parameters = parameters.set("imageTag", tag.as_str());
        }

        Self {
            parameters,
            seed_configs: Vec::new(),
            web_service_suffix: "web".to_string(),
            web_port: config.web_port,
            username: config.username.clone(),
            password: config.password.clone(),
            readiness: PollPolicy::new(config.readiness_interval, config.readiness_timeout),
            workers: PollPolicy::new(config.worker_poll_interval, config.worker_poll_timeout),
        }
    }

    /// One in-cluster worker with fast GC and heartbeats, plus an empty
    /// worker public key for external workers to pick up later.
    pub fn external_workers(config: &HarnessConfig) -> Self {
        Self::from_config(config)
            .with_parameters(|p| {
                p.gc_interval("300ms")
                    .heartbeat_interval("300ms")
                    .worker_replicas(1)
                    .worker_storage_driver("overlay")
            })
            .seed_config(WORKER_PUBLIC_KEY, "")
    }

    #[must_use]
    pub fn with_parameters(
        mut self,
        f: impl FnOnce(DeploymentParameters) -> DeploymentParameters,
    ) -> Self {
        self.parameters = f(self.parameters);
        self
    }

    #[must_use]
    pub fn seed_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.seed_configs.push((key.into(), value.into()));
        self
    }

    pub fn web_service(&self, identity: &ReleaseIdentity) -> String {
        format!("{}-{}", identity.name(), self.web_service_suffix)
    }
}

/// What the test body gets to see once the environment is verified.
#[derive(Clone)]
pub struct ScenarioView {
    identity: ReleaseIdentity,
    endpoint: String,
    session: Session,
    workers: Vec<Worker>,
    web: Arc<dyn WorkerApi>,
}

impl ScenarioView {
    pub fn identity(&self) -> &ReleaseIdentity {
        &self.identity
    }

    /// Local base URL of the proxied web service.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Running workers observed when verification succeeded.
    pub fn running_workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Fresh worker listing through the scenario's session.
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        self.web.list_workers(&self.session).await
    }
}

impl fmt::Debug for ScenarioView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioView")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .field("session", &self.session)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Result of one scenario run.
#[derive(Debug)]
pub struct ScenarioOutcome<T> {
    pub result: std::result::Result<T, ScenarioError>,
    /// Every state entered, starting with `Idle`.
    pub history: Vec<ScenarioState>,
    /// Teardown failures; logged, never the reported cause.
    pub teardown_errors: Vec<HarnessError>,
}

impl<T> ScenarioOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// # Errors
    ///
    /// The scenario failure, if any. Teardown errors are not included.
    pub fn into_result(self) -> std::result::Result<T, ScenarioError> {
        self.result
    }
}

/// Mutable state of one scenario instance.
///
/// Owns the acquired resources; dropping it before teardown schedules
/// teardown on the current runtime.
pub struct ScenarioContext {
    identity: ReleaseIdentity,
    collaborators: Collaborators,
    state: ScenarioState,
    history: Vec<ScenarioState>,
    release_acquired: bool,
    proxy: Option<Box<dyn ProxyLease>>,
    teardown_errors: Vec<HarnessError>,
}

impl ScenarioContext {
    pub fn new(identity: ReleaseIdentity, collaborators: Collaborators) -> Self {
        Self {
            identity,
            collaborators,
            state: ScenarioState::Idle,
            history: vec![ScenarioState::Idle],
            release_acquired: false,
            proxy: None,
            teardown_errors: Vec::new(),
        }
    }

    pub fn identity(&self) -> &ReleaseIdentity {
        &self.identity
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn history(&self) -> &[ScenarioState] {
        &self.history
    }

    fn enter(&mut self, next: ScenarioState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal scenario transition {} -> {}",
            self.state,
            next
        );
        info!(
            target: "env.scenario",
            release = %self.identity,
            from = %self.state,
            to = %next,
            "Scenario transition"
        );
        self.state = next;
        self.history.push(next);
    }

    fn failed(&self, source: HarnessError) -> ScenarioError {
        error!(
            target: "env.scenario",
            release = %self.identity,
            state = %self.state,
            kind = source.kind(),
            error = %source,
            "Scenario step failed"
        );
        ScenarioError {
            identity: self.identity.name().to_string(),
            state: self.state,
            source,
        }
    }

    /// Acquire and verify the environment, stopping at the first failure.
    ///
    /// On success the context is in `Verifying` with the proxy held.
    async fn setup(&mut self, plan: &ScenarioPlan) -> std::result::Result<ScenarioView, ScenarioError> {
        let Collaborators {
            releases,
            pods,
            forwarder,
            web,
        } = self.collaborators.clone();
        let namespace = self.identity.namespace().to_string();

        self.enter(ScenarioState::Deploying);
        // Marked before install so a half-finished install is still removed.
        self.release_acquired = true;
        releases
            .install(&self.identity, &plan.parameters)
            .await
            .map_err(|e| self.failed(e))?;
        for (key, value) in &plan.seed_configs {
            releases
                .seed_config(&self.identity, key, value)
                .await
                .map_err(|e| self.failed(e))?;
        }

        self.enter(ScenarioState::AwaitingReady);
        wait_all_ready(pods.as_ref(), &namespace, plan.readiness)
            .await
            .map_err(|e| self.failed(e))?;

        self.enter(ScenarioState::ProxyOpen);
        let service = plan.web_service(&self.identity);
        let lease = forwarder
            .open(&namespace, &service, plan.web_port)
            .await
            .map_err(|e| self.failed(e))?;
        let endpoint = lease.endpoint().to_string();
        self.proxy = Some(lease);

        self.enter(ScenarioState::Authenticated);
        let session = web
            .login(&plan.username, &plan.password, &endpoint)
            .await
            .map_err(|e| self.failed(e))?;

        self.enter(ScenarioState::Verifying);
        let api = web.as_ref();
        let probe_session = &session;
        let workers = eventually(
            move || async move { api.list_workers(probe_session).await.map(running_workers) },
            |workers: &Vec<Worker>| !workers.is_empty(),
            plan.workers,
        )
        .await
        .map_err(|e| self.failed(HarnessError::from(e)))?;

        info!(
            target: "env.scenario",
            release = %self.identity,
            running = workers.len(),
            "Workers registered"
        );

        Ok(ScenarioView {
            identity: self.identity.clone(),
            endpoint,
            session,
            workers,
            web,
        })
    }

    async fn drive<T, F, Fut>(
        &mut self,
        plan: &ScenarioPlan,
        body: F,
    ) -> std::result::Result<T, ScenarioError>
    where
        F: FnOnce(ScenarioView) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let view = self.setup(plan).await?;
        self.enter(ScenarioState::Running);
        body(view).await.map_err(|e| self.failed(e))
    }

    /// Release everything acquired, proxy first. Runs at most once.
    pub async fn teardown(&mut self) {
        if matches!(self.state, ScenarioState::TearingDown | ScenarioState::Done) {
            return;
        }
        self.enter(ScenarioState::TearingDown);

        let releases = std::mem::take(&mut self.release_acquired)
            .then(|| Arc::clone(&self.collaborators.releases));
        let release = release_resources(self.identity.clone(), self.proxy.take(), releases);

        // The resources have left this context; teardown must outlive a
        // cancelled caller.
        let errors = match tokio::runtime::Handle::try_current() {
            Ok(handle) => match handle.spawn(release).await {
                Ok(errors) => errors,
                Err(e) => {
                    error!(
                        target: "env.scenario",
                        release = %self.identity,
                        error = %e,
                        "Teardown task failed; release may be leaked"
                    );
                    Vec::new()
                }
            },
            Err(_) => release.await,
        };
        self.teardown_errors.extend(errors);

        self.enter(ScenarioState::Done);
    }
}

impl Drop for ScenarioContext {
    fn drop(&mut self) {
        if self.state.is_terminal() || (self.proxy.is_none() && !self.release_acquired) {
            return;
        }

        let identity = self.identity.clone();
        let proxy = self.proxy.take();
        let releases = std::mem::take(&mut self.release_acquired)
            .then(|| Arc::clone(&self.collaborators.releases));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    target: "env.scenario",
                    release = %identity,
                    state = %self.state,
                    "Scenario dropped before teardown, scheduling cleanup"
                );
                handle.spawn(async move {
                    release_resources(identity, proxy, releases).await;
                });
            }
            Err(_) => {
                error!(
                    target: "env.scenario",
                    release = %identity,
                    "Scenario dropped outside a runtime; release and namespace leaked"
                );
            }
        }
    }
}

/// Close the proxy, then uninstall. Both are attempted; failures are
/// logged and returned, never raised.
async fn release_resources(
    identity: ReleaseIdentity,
    proxy: Option<Box<dyn ProxyLease>>,
    releases: Option<Arc<dyn ReleaseManager>>,
) -> Vec<HarnessError> {
    let mut errors = Vec::new();

    if let Some(mut proxy) = proxy {
        if let Err(e) = proxy.close().await {
            warn!(target: "env.scenario", release = %identity, error = %e, "Proxy close failed during teardown");
            errors.push(e);
        }
    }

    if let Some(releases) = releases {
        if let Err(e) = releases.uninstall(&identity).await {
            warn!(target: "env.scenario", release = %identity, error = %e, "Uninstall failed during teardown");
            errors.push(e);
        }
    }

    info!(
        target: "env.scenario",
        release = %identity,
        failures = errors.len(),
        "Teardown complete"
    );
    errors
}

/// One isolated scenario instance: an identity, a plan, and the systems to
/// drive.
pub struct Scenario {
    plan: ScenarioPlan,
    context: ScenarioContext,
}

impl Scenario {
    pub fn new(identity: ReleaseIdentity, plan: ScenarioPlan, collaborators: Collaborators) -> Self {
        Self {
            plan,
            context: ScenarioContext::new(identity, collaborators),
        }
    }

    pub fn identity(&self) -> &ReleaseIdentity {
        self.context.identity()
    }

    /// Provision and verify the environment, run `body`, then tear down.
    ///
    /// Teardown runs on every exit path. A panic in `body` is resumed after
    /// teardown completes.
    #[instrument(skip_all, fields(release = %self.context.identity()))]
    pub async fn run<T, F, Fut>(self, body: F) -> ScenarioOutcome<T>
    where
        F: FnOnce(ScenarioView) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let Scenario { plan, mut context } = self;

        let result = AssertUnwindSafe(context.drive(&plan, body))
            .catch_unwind()
            .await;

        context.teardown().await;

        match result {
            Ok(result) => ScenarioOutcome {
                result,
                history: context.history.clone(),
                teardown_errors: std::mem::take(&mut context.teardown_errors),
            },
            Err(panic) => {
                error!(
                    target: "env.scenario",
                    release = %context.identity,
                    "Test body panicked; resuming after teardown"
                );
                std::panic::resume_unwind(panic)
            }
        }
    }
}
