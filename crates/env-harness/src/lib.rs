//! Ephemeral Environment Test Harness
//!
//! Provisions a short-lived, uniquely named deployment of the CI system into
//! a Kubernetes cluster, reaches it through a port-forward, logs in, waits
//! for worker registration to converge, runs a test body, and always tears
//! everything down again.
//!
//! # Features
//!
//! - `smoke`: tool and cluster reachability checks (seconds)
//! - `external-workers`: full deploy/verify/teardown scenario (minutes)
//! - `all`: enable all test categories
//!
//! # Prerequisites
//!
//! 1. A reachable cluster (`KUBECONFIG` or the default context)
//! 2. `helm` and `kubectl` in PATH, or `HARNESS_HELM_BIN` / `HARNESS_KUBECTL_BIN`
//! 3. `HARNESS_CHART` naming the chart to install
//!
//! # Usage
//!
//! ```bash
//! # Unit and fake-backed scenario tests only
//! cargo test -p env-harness
//!
//! # Tool smoke checks
//! cargo test -p env-harness --features smoke
//!
//! # Real deployment against the cluster
//! HARNESS_CHART=concourse/concourse cargo test -p env-harness --features external-workers
//! ```

pub mod cluster;
pub mod deployment;
pub mod eventual;
pub mod fixtures;
pub mod identity;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod scenario;
pub mod telemetry;
