//! Port-forward sessions into the cluster.
//!
//! A [`ProxySession`] owns a `kubectl port-forward` process. The session is
//! handed out only after the forwarded local port accepts a TCP connection,
//! and it must be closed before the namespace it targets is deleted.

use crate::process::{Invocation, ProcessHandle, ProcessSupervisor};
use async_trait::async_trait;
use common::error::{HarnessError, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Delay between TCP connection attempts while confirming a forward.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long a stopping forwarder gets before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// `kubectl port-forward` announces each listener on its own line.
#[allow(clippy::expect_used)] // Constant pattern.
static FORWARDING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Forwarding from (?:127\.0\.0\.1|\[::1\]):(\d+) -> \d+")
        .expect("forwarding pattern is valid")
});

/// Extract the local port from a `Forwarding from ...` line.
fn parse_forwarding_line(line: &str) -> Option<u16> {
    FORWARDING_PATTERN
        .captures(line.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|port| port.as_str().parse().ok())
}

/// A live, confirmed network path to an in-cluster service.
#[async_trait]
pub trait ProxyLease: Send {
    /// Locally reachable base URL, e.g. `http://127.0.0.1:43121`.
    fn endpoint(&self) -> &str;

    /// Stop forwarding. Closing an already-closed lease is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Opens [`ProxyLease`]s to services inside a namespace.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn open(
        &self,
        namespace: &str,
        service: &str,
        remote_port: u16,
    ) -> Result<Box<dyn ProxyLease>>;
}

/// Forwards through `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct PortForwarder {
    supervisor: ProcessSupervisor,
    kubectl: Invocation,
    confirm_timeout: Duration,
}

impl PortForwarder {
    pub fn new(supervisor: ProcessSupervisor, kubectl: Invocation, confirm_timeout: Duration) -> Self {
        Self {
            supervisor,
            kubectl,
            confirm_timeout,
        }
    }

    fn invocation(&self, namespace: &str, service: &str, remote_port: u16) -> Invocation {
        self.kubectl.clone().args([
            "port-forward".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            format!("service/{service}"),
            // Empty local side: kubectl picks a free port and reports it.
            format!(":{remote_port}"),
        ])
    }

    /// Start forwarding and wait until the local port accepts connections.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if kubectl cannot be started; `ProxyUnavailable` if
    /// the forwarder exits or is not connectable within the confirmation
    /// timeout. The forwarder process is stopped before returning an error.
    #[instrument(skip(self), fields(timeout = ?self.confirm_timeout))]
    pub async fn open_proxy(
        &self,
        namespace: &str,
        service: &str,
        remote_port: u16,
    ) -> Result<ProxySession> {
        let mut process = self
            .supervisor
            .start(&self.invocation(namespace, service, remote_port))?;

        let confirmed =
            tokio::time::timeout(self.confirm_timeout, await_forwarding(&mut process)).await;

        let reason = match confirmed {
            Ok(Ok(local_port)) => {
                let session = ProxySession::new(process, local_port);
                info!(
                    target: "env.proxy",
                    namespace,
                    service,
                    remote_port,
                    endpoint = %session.endpoint,
                    "Port-forward established"
                );
                return Ok(session);
            }
            Ok(Err(reason)) => reason,
            Err(_) => format!(
                "forward not connectable within {:?}",
                self.confirm_timeout
            ),
        };

        warn!(target: "env.proxy", namespace, service, %reason, "Port-forward unavailable");
        stop(&mut process).await;

        Err(HarnessError::ProxyUnavailable {
            namespace: namespace.to_string(),
            service: service.to_string(),
            reason,
        })
    }
}

#[async_trait]
impl Forwarder for PortForwarder {
    async fn open(
        &self,
        namespace: &str,
        service: &str,
        remote_port: u16,
    ) -> Result<Box<dyn ProxyLease>> {
        let session = self.open_proxy(namespace, service, remote_port).await?;
        Ok(Box::new(session))
    }
}

/// Read forwarder output until it announces a port, then confirm the port.
async fn await_forwarding(process: &mut ProcessHandle) -> std::result::Result<u16, String> {
    let local_port = loop {
        match process.next_line().await {
            Some(line) => {
                if let Some(port) = parse_forwarding_line(&line) {
                    break port;
                }
            }
            None => {
                let status = process
                    .wait()
                    .await
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                return Err(format!("forwarder exited before forwarding ({status})"));
            }
        }
    };

    loop {
        if let Ok(Some(status)) = process.try_exit() {
            return Err(format!("forwarder exited during confirmation ({status})"));
        }
        match TcpStream::connect(("127.0.0.1", local_port)).await {
            Ok(_) => return Ok(local_port),
            Err(e) => {
                debug!(target: "env.proxy", local_port, error = %e, "Forward not connectable yet");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

/// Interrupt, then kill if the process ignores the interrupt.
async fn stop(process: &mut ProcessHandle) {
    if let Err(e) = process.interrupt() {
        warn!(target: "env.proxy", error = %e, "Failed to interrupt forwarder");
    }
    if tokio::time::timeout(STOP_GRACE, process.wait()).await.is_err() {
        warn!(target: "env.proxy", "Forwarder ignored interrupt; killing");
        if let Err(e) = process.kill().await {
            warn!(target: "env.proxy", error = %e, "Failed to kill forwarder");
        }
    }
}

/// A confirmed port-forward. Owns its forwarder process exclusively.
///
/// Dropping an open session kills the forwarder; call [`ProxySession::close`]
/// for a graceful stop.
#[derive(Debug)]
pub struct ProxySession {
    process: Option<ProcessHandle>,
    local_port: u16,
    endpoint: String,
}

impl ProxySession {
    fn new(process: ProcessHandle, local_port: u16) -> Self {
        Self {
            process: Some(process),
            local_port,
            endpoint: format!("http://127.0.0.1:{local_port}"),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_closed(&self) -> bool {
        self.process.is_none()
    }

    /// Interrupt the forwarder and wait up to the stop grace period for it
    /// to exit, killing it otherwise. Idempotent.
    ///
    /// The forwarder is gone when this returns, whether or not it errors.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the forwarder could not be reaped or killed;
    /// `ExitFailure` with no code if it ignored the interrupt and was killed.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            debug!(target: "env.proxy", endpoint = %self.endpoint, "Proxy already closed");
            return Ok(());
        };

        if let Err(e) = process.interrupt() {
            warn!(target: "env.proxy", endpoint = %self.endpoint, error = %e, "Failed to interrupt forwarder");
        }
        match tokio::time::timeout(STOP_GRACE, process.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(
                    target: "env.proxy",
                    endpoint = %self.endpoint,
                    %status,
                    "Port-forward closed"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    target: "env.proxy",
                    endpoint = %self.endpoint,
                    grace = ?STOP_GRACE,
                    "Forwarder still running after interrupt; killing"
                );
                process.kill().await?;
                Err(HarnessError::ExitFailure {
                    program: process.program().to_string(),
                    code: None,
                    output: format!(
                        "forwarder for {} ignored SIGINT for {STOP_GRACE:?} and was killed",
                        self.endpoint
                    ),
                })
            }
        }
    }
}

#[async_trait]
impl ProxyLease for ProxySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn close(&mut self) -> Result<()> {
        ProxySession::close(self).await
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if self.process.is_some() {
            warn!(
                target: "env.proxy",
                endpoint = %self.endpoint,
                "Proxy dropped without close; killing forwarder"
            );
        }
    }
}
