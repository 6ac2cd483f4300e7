//! Eventual consistency helpers for timing-dependent assertions.
//!
//! Worker registration, pod readiness, and similar distributed properties
//! converge some time after the action that triggers them. [`eventually`]
//! polls a probe at a fixed interval until a condition holds or a deadline
//! elapses, and reports the last observed value when it gives up.

use common::error::HarnessError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Fixed-interval polling schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep between consecutive probes.
    pub interval: Duration,
    /// Wall-clock budget measured from the first probe.
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why [`eventually`] gave up.
#[derive(Debug)]
pub enum EventuallyError<T> {
    /// The deadline passed without a satisfying value.
    Timeout {
        timeout: Duration,
        attempts: u32,
        /// Most recent successful probe result, if any.
        last_value: Option<T>,
        /// Error from the most recent probe, if that probe failed.
        last_error: Option<HarnessError>,
    },

    /// A probe failed with an error that waiting cannot fix.
    Aborted(HarnessError),
}

impl<T: fmt::Debug> EventuallyError<T> {
    /// Render the final observation for diagnostics.
    pub fn last_observed(&self) -> String {
        match self {
            EventuallyError::Timeout {
                last_error: Some(err),
                ..
            } => format!("error: {err}"),
            EventuallyError::Timeout {
                last_value: Some(value),
                ..
            } => format!("{value:?}"),
            EventuallyError::Timeout { .. } => "nothing observed".to_string(),
            EventuallyError::Aborted(err) => format!("error: {err}"),
        }
    }
}

impl<T: fmt::Debug> From<EventuallyError<T>> for HarnessError {
    fn from(err: EventuallyError<T>) -> Self {
        let last_observed = err.last_observed();
        match err {
            EventuallyError::Timeout {
                timeout, attempts, ..
            } => HarnessError::ConditionTimeout {
                timeout,
                attempts,
                last_observed,
            },
            EventuallyError::Aborted(err) => err,
        }
    }
}

/// Poll `probe` until `condition` accepts its result.
///
/// The first probe runs immediately; every later probe follows a full
/// `interval` sleep. The wait fails only once `timeout` has elapsed since the
/// first probe, never earlier. Probe errors count as unsatisfied results
/// unless [`HarnessError::is_retryable`] says otherwise.
///
/// Each probe is bounded by the remaining budget, or one `interval` when
/// less than that remains. A probe that overruns is dropped and recorded
/// as [`HarnessError::ProbeTimeout`].
///
/// # Example
///
/// ```no_run
/// use env_harness::eventual::{eventually, PollPolicy};
/// use std::time::Duration;
///
/// # async fn example(web: &dyn env_harness::fixtures::WorkerApi, session: &common::types::Session) {
/// let running = eventually(
///     move || async move { web.list_workers(session).await.map(common::types::running_workers) },
///     |workers| !workers.is_empty(),
///     PollPolicy::new(Duration::from_secs(10), Duration::from_secs(120)),
/// )
/// .await
/// .expect("a worker should register within two minutes");
/// # }
/// ```
pub async fn eventually<T, F, Fut, C>(
    mut probe: F,
    condition: C,
    policy: PollPolicy,
) -> Result<T, EventuallyError<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HarnessError>>,
    C: Fn(&T) -> bool,
{
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_value = None;

    loop {
        attempts = attempts.saturating_add(1);

        let bound = policy
            .timeout
            .saturating_sub(start.elapsed())
            .max(policy.interval);
        let outcome = timeout(bound, probe())
            .await
            .unwrap_or(Err(HarnessError::ProbeTimeout(bound)));

        let last_error = match outcome {
            Ok(value) if condition(&value) => {
                debug!(
                    target: "env.eventual",
                    attempts,
                    elapsed = ?start.elapsed(),
                    "Condition satisfied"
                );
                return Ok(value);
            }
            Ok(value) => {
                last_value = Some(value);
                None
            }
            Err(err) if !err.is_retryable() => {
                debug!(target: "env.eventual", attempts, error = %err, "Probe failed fatally");
                return Err(EventuallyError::Aborted(err));
            }
            Err(err) => {
                debug!(target: "env.eventual", attempts, error = %err, "Probe failed, retrying");
                Some(err)
            }
        };

        if start.elapsed() >= policy.timeout {
            return Err(EventuallyError::Timeout {
                timeout: policy.timeout,
                attempts,
                last_value,
                last_error,
            });
        }

        sleep(policy.interval).await;
    }
}
