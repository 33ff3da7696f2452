//! Polling of long-running external operations.
//!
//! [`monitor`] polls an operation at a fixed interval until the operation
//! finishes, disappears or the upper bound elapses. Intermediate snapshots
//! are surfaced through a callback so callers can record output as it
//! arrives.

pub mod task_runner;

pub use task_runner::{
    apply_container_state, map_container_state, ComponentTaskRunner, ContainerInstanceView,
    ContainerRunner, ContainerState,
};

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("monitoring {resource} timed out after {}s", .after.as_secs())]
    Timeout { resource: String, after: Duration },

    #[error("poll failed: {0}")]
    Poll(String),

    #[error("container runner error: {0}")]
    Runner(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl MonitorOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState<T> {
    /// Still running; `T` is the latest snapshot.
    Pending(T),
    /// Reached a terminal state.
    Done(T),
    /// The monitored resource no longer exists.
    Gone,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome<T> {
    Finished(T),
    Gone,
}

/// Call `poll` until it reports a terminal state.
///
/// Every snapshot is handed to `on_update`. Poll errors are logged and
/// polling continues; only the upper bound ends a run that never finishes.
pub async fn monitor<T, F, Fut, U>(
    resource: &str,
    options: MonitorOptions,
    mut poll: F,
    mut on_update: U,
) -> Result<MonitorOutcome<T>, MonitorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, MonitorError>>,
    U: FnMut(&T),
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match poll().await {
            Ok(PollState::Pending(snapshot)) => {
                debug!(resource, attempt, "monitored resource still running");
                on_update(&snapshot);
            }
            Ok(PollState::Done(snapshot)) => {
                on_update(&snapshot);
                return Ok(MonitorOutcome::Finished(snapshot));
            }
            Ok(PollState::Gone) => {
                warn!(resource, attempt, "monitored resource disappeared");
                return Ok(MonitorOutcome::Gone);
            }
            Err(e) => {
                warn!(resource, attempt, error = %e, "poll failed; polling continues");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            warn!(resource, attempt, elapsed_secs = elapsed.as_secs(), "monitoring timed out");
            return Err(MonitorError::Timeout {
                resource: resource.to_string(),
                after: options.timeout,
            });
        }
        tokio::time::sleep(options.interval.min(options.timeout - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn scripted(
        states: Vec<Result<PollState<u32>, MonitorError>>,
    ) -> impl FnMut() -> std::future::Ready<Result<PollState<u32>, MonitorError>> {
        let states = Arc::new(Mutex::new(VecDeque::from(states)));
        move || {
            let next = states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollState::Pending(0)));
            std::future::ready(next)
        }
    }

    fn options() -> MonitorOptions {
        MonitorOptions::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_progress_until_done() {
        let mut seen = Vec::new();
        let outcome = monitor(
            "run-1",
            options(),
            scripted(vec![
                Ok(PollState::Pending(1)),
                Err(MonitorError::Poll("flaky".to_string())),
                Ok(PollState::Pending(2)),
                Ok(PollState::Done(3)),
            ]),
            |s| seen.push(*s),
        )
        .await
        .unwrap();

        assert_eq!(outcome, MonitorOutcome::Finished(3));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn disappearing_resource_ends_monitoring() {
        let outcome = monitor(
            "run-1",
            options(),
            scripted(vec![Ok(PollState::Pending(1)), Ok(PollState::Gone)]),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(outcome, MonitorOutcome::Gone);
    }

    #[tokio::test(start_paused = true)]
    async fn never_finishing_run_times_out() {
        let started = Instant::now();
        let err = monitor("run-1", options(), scripted(vec![]), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, MonitorError::Timeout { ref resource, .. } if resource == "run-1"));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }
}
