//! In-memory collaborators for scenario tests.
//!
//! Every fake appends to a shared [`EventLog`] so tests can assert on the
//! exact order of external effects.

#![allow(dead_code)]

use async_trait::async_trait;
use common::error::{HarnessError, Result};
use common::secret::{ExposeSecret, SecretString};
use common::types::{DeploymentParameters, ReleaseIdentity, Session, Worker, WorkerState};
use env_harness::deployment::ReleaseManager;
use env_harness::fixtures::WorkerApi;
use env_harness::proxy::{Forwarder, ProxyLease};
use env_harness::readiness::{PodReadiness, PodStatusSource};
use env_harness::scenario::{Collaborators, ScenarioPlan};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of side effects across all fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Events with consecutive repeats (polling) collapsed.
    pub fn distinct(&self) -> Vec<String> {
        let mut events = self.events();
        events.dedup();
        events
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Knobs for the fake environment. Defaults describe a healthy cluster.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub fail_install: bool,
    pub fail_seed: bool,
    pub fail_uninstall: bool,
    /// Pod polls before all pods report ready; `None` means never.
    pub pods_ready_after: Option<u32>,
    pub fail_proxy: bool,
    pub fail_proxy_close: bool,
    /// How long a proxy close takes.
    pub close_delay: Option<Duration>,
    pub reject_login: bool,
    /// Worker listings before a running worker appears; `None` means never.
    pub workers_running_after: Option<u32>,
}

impl Behaviour {
    pub fn healthy() -> Self {
        Self {
            pods_ready_after: Some(0),
            workers_running_after: Some(0),
            ..Self::default()
        }
    }
}

pub struct FakeReleases {
    log: EventLog,
    behaviour: Behaviour,
}

#[async_trait]
impl ReleaseManager for FakeReleases {
    async fn install(
        &self,
        identity: &ReleaseIdentity,
        parameters: &DeploymentParameters,
    ) -> Result<()> {
        self.log.push(format!(
            "install {} {}",
            identity.name(),
            parameters.to_args().join(" ")
        ));
        if self.behaviour.fail_install {
            return Err(HarnessError::DeploymentFailed {
                release: identity.name().to_string(),
                output: "Error: INSTALLATION FAILED: chart not found".to_string(),
            });
        }
        Ok(())
    }

    async fn seed_config(&self, identity: &ReleaseIdentity, key: &str, value: &str) -> Result<()> {
        self.log
            .push(format!("seed {} {key}={value}", identity.namespace()));
        if self.behaviour.fail_seed {
            return Err(HarnessError::ExitFailure {
                program: "kubectl".to_string(),
                code: Some(1),
                output: format!(
                    "error: failed to create configmap \"{key}\": namespaces \"{}\" not found",
                    identity.namespace()
                ),
            });
        }
        Ok(())
    }

    async fn uninstall(&self, identity: &ReleaseIdentity) -> Result<()> {
        self.log.push(format!("uninstall {}", identity.name()));
        if self.behaviour.fail_uninstall {
            return Err(HarnessError::ExitFailure {
                program: "helm".to_string(),
                code: Some(1),
                output: "Error: uninstall: Release not loaded".to_string(),
            });
        }
        Ok(())
    }
}

pub struct FakePods {
    log: EventLog,
    ready_after: Option<u32>,
    polls: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl PodStatusSource for FakePods {
    async fn pod_readiness(&self, namespace: &str) -> Result<Vec<PodReadiness>> {
        self.log.push(format!("pods {namespace}"));
        let polls = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(namespace.to_string()).or_insert(0);
            let seen = *count;
            *count += 1;
            seen
        };

        let ready = self.ready_after.is_some_and(|after| polls >= after);
        Ok(vec![
            PodReadiness {
                name: format!("{namespace}-web-0"),
                ready: true,
            },
            PodReadiness {
                name: format!("{namespace}-worker-0"),
                ready,
            },
        ])
    }
}

pub struct FakeForwarder {
    log: EventLog,
    behaviour: Behaviour,
    next_port: AtomicU32,
}

#[async_trait]
impl Forwarder for FakeForwarder {
    async fn open(
        &self,
        namespace: &str,
        service: &str,
        remote_port: u16,
    ) -> Result<Box<dyn ProxyLease>> {
        self.log
            .push(format!("open {namespace} {service}:{remote_port}"));
        if self.behaviour.fail_proxy {
            return Err(HarnessError::ProxyUnavailable {
                namespace: namespace.to_string(),
                service: service.to_string(),
                reason: "forwarder exited: pod not running".to_string(),
            });
        }
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakeLease {
            log: self.log.clone(),
            endpoint: format!("http://127.0.0.1:{port}"),
            closed: false,
            fail_close: self.behaviour.fail_proxy_close,
            close_delay: self.behaviour.close_delay,
        }))
    }
}

pub struct FakeLease {
    log: EventLog,
    endpoint: String,
    closed: bool,
    fail_close: bool,
    close_delay: Option<Duration>,
}

#[async_trait]
impl ProxyLease for FakeLease {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.log.push(format!("close {}", self.endpoint));
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_close {
            return Err(HarnessError::LaunchFailure {
                program: "kubectl".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "operation not permitted",
                ),
            });
        }
        Ok(())
    }
}

pub struct FakeWeb {
    log: EventLog,
    behaviour: Behaviour,
    listings: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl WorkerApi for FakeWeb {
    async fn login(
        &self,
        username: &str,
        password: &SecretString,
        endpoint: &str,
    ) -> Result<Session> {
        self.log.push(format!(
            "login {username}:{} {endpoint}",
            password.expose_secret()
        ));
        if self.behaviour.reject_login {
            return Err(HarnessError::AuthenticationFailed(format!(
                "login as '{username}' returned 401 Unauthorized"
            )));
        }
        Ok(Session::new(
            endpoint,
            SecretString::from(format!("token-for-{endpoint}")),
        ))
    }

    async fn list_workers(&self, session: &Session) -> Result<Vec<Worker>> {
        self.log.push(format!("list_workers {}", session.endpoint()));
        let listings = {
            let mut listings = self.listings.lock().unwrap();
            let count = listings.entry(session.endpoint().to_string()).or_insert(0);
            let seen = *count;
            *count += 1;
            seen
        };

        let mut workers = vec![worker("external-worker", WorkerState::Stalled)];
        if self
            .behaviour
            .workers_running_after
            .is_some_and(|after| listings >= after)
        {
            workers.push(worker("in-cluster-worker-0", WorkerState::Running));
        }
        Ok(workers)
    }
}

fn worker(name: &str, state: WorkerState) -> Worker {
    Worker {
        name: name.to_string(),
        state,
        platform: Some("linux".to_string()),
        team: None,
        version: Some("2.5".to_string()),
        active_containers: 0,
    }
}

/// A fake environment: collaborators plus the log they write to.
pub struct FakeEnvironment {
    pub log: EventLog,
    pub collaborators: Collaborators,
}

impl FakeEnvironment {
    pub fn new(behaviour: Behaviour) -> Self {
        let log = EventLog::default();
        let collaborators = Collaborators {
            releases: Arc::new(FakeReleases {
                log: log.clone(),
                behaviour: behaviour.clone(),
            }),
            pods: Arc::new(FakePods {
                log: log.clone(),
                ready_after: behaviour.pods_ready_after,
                polls: Mutex::new(HashMap::new()),
            }),
            forwarder: Arc::new(FakeForwarder {
                log: log.clone(),
                behaviour: behaviour.clone(),
                next_port: AtomicU32::new(40_001),
            }),
            web: Arc::new(FakeWeb {
                log: log.clone(),
                behaviour,
                listings: Mutex::new(HashMap::new()),
            }),
        };
        Self { log, collaborators }
    }

    pub fn healthy() -> Self {
        Self::new(Behaviour::healthy())
    }
}

/// The external-workers plan with default timeouts.
pub fn plan() -> ScenarioPlan {
    let vars = HashMap::from([(
        "HARNESS_CHART".to_string(),
        "concourse/concourse".to_string(),
    )]);
    let config = common::config::HarnessConfig::from_vars(&vars).unwrap();
    ScenarioPlan::external_workers(&config)
}

pub fn identity(slot: u32) -> ReleaseIdentity {
    ReleaseIdentity::generate("demo", 1, slot).unwrap()
}
