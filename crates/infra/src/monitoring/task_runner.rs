//! Component task runs executed in a container.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use teamcloud_commands::{Command, CommandError, CommandPayload, CommandResult};
use teamcloud_core::{ComponentTask, ResourceState};

use crate::lock::{with_lock, DistributedLockManager, LockRequest};
use crate::orchestration::{CommandHandler, HandlerError};

use super::{monitor, MonitorError, MonitorOptions, MonitorOutcome, PollState};

/// Upper bound of a single task run.
pub const TASK_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInstanceView {
    /// Container state as reported by the host, e.g. `Running`, `Terminated`.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Absent until the host has scheduled the container.
    #[serde(default)]
    pub instance: Option<ContainerInstanceView>,
}

pub fn map_container_state(state: &ContainerState) -> ResourceState {
    let Some(view) = &state.instance else {
        return ResourceState::Initializing;
    };
    match view.exit_code {
        Some(0) => ResourceState::Succeeded,
        Some(_) => ResourceState::Failed,
        None if view
            .state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("terminated")) =>
        {
            ResourceState::Failed
        }
        None => ResourceState::Provisioning,
    }
}

/// Copy what the container reported onto the task.
pub fn apply_container_state(task: &mut ComponentTask, state: &ContainerState) {
    task.resource_state = map_container_state(state);
    if let Some(view) = &state.instance {
        task.exit_code = view.exit_code.or(task.exit_code);
        task.started = view.started.or(task.started);
        task.finished = view.finished.or(task.finished);
        for event in &view.events {
            if !task.output.contains(event) {
                task.output.push(event.clone());
            }
        }
    }
}

/// Host of task containers.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Start the container for `task`; returns its resource id.
    async fn start(&self, task: &ComponentTask) -> Result<String, MonitorError>;

    /// Current state, `None` once the container no longer exists.
    async fn state(&self, resource_id: &str) -> Result<Option<ContainerState>, MonitorError>;

    async fn terminate(&self, resource_id: &str) -> Result<(), MonitorError>;
}

/// Runs `ComponentTask` commands: one container per run, serialized per
/// component through a distributed lock.
pub struct ComponentTaskRunner {
    runner: Arc<dyn ContainerRunner>,
    locks: Arc<dyn DistributedLockManager>,
    options: MonitorOptions,
}

impl std::fmt::Debug for ComponentTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTaskRunner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ComponentTaskRunner {
    pub fn new(
        runner: Arc<dyn ContainerRunner>,
        locks: Arc<dyn DistributedLockManager>,
        monitor_interval: Duration,
    ) -> Self {
        Self {
            runner,
            locks,
            options: MonitorOptions::new(monitor_interval, TASK_RUN_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Start and watch one container. The started resource id is left in
    /// `started` so the caller can terminate it whatever happens to this
    /// future.
    async fn run(
        &self,
        mut task: ComponentTask,
        started: &Mutex<Option<String>>,
    ) -> (ComponentTask, Option<MonitorError>) {
        task.resource_state = ResourceState::Initializing;
        task.started = task.started.or(Some(Utc::now()));

        let resource_id = match self.runner.start(&task).await {
            Ok(id) => id,
            Err(e) => {
                task.resource_state = ResourceState::Failed;
                return (task, Some(e));
            }
        };
        *started.lock().unwrap_or_else(PoisonError::into_inner) = Some(resource_id.clone());
        task.resource_id = Some(resource_id.clone());
        task.resource_state = ResourceState::Provisioning;
        info!(task_id = %task.id, resource_id = %resource_id, "component task runner started");

        let runner = self.runner.clone();
        let poll = || {
            let runner = runner.clone();
            let resource_id = resource_id.clone();
            async move {
                Ok::<_, MonitorError>(match runner.state(&resource_id).await? {
                    None => PollState::Gone,
                    Some(state) if map_container_state(&state).is_final() => PollState::Done(state),
                    Some(state) => PollState::Pending(state),
                })
            }
        };
        let outcome = monitor(&resource_id, self.options, poll, |state| {
            apply_container_state(&mut task, state)
        })
        .await;

        let error = match outcome {
            Ok(MonitorOutcome::Finished(_)) => None,
            Ok(MonitorOutcome::Gone) => {
                task.resource_state = ResourceState::Failed;
                task.output.push("component task runner disappeared".to_string());
                None
            }
            Err(e) => {
                task.resource_state = ResourceState::Failed;
                Some(e)
            }
        };
        task.finished = task.finished.or(Some(Utc::now()));
        (task, error)
    }
}

#[async_trait]
impl CommandHandler for ComponentTaskRunner {
    async fn handle(
        &self,
        command: &Command,
        mut result: CommandResult,
    ) -> Result<CommandResult, HandlerError> {
        let CommandPayload::ComponentTask(task) = &command.payload else {
            return Err(HandlerError::failed(format!(
                "{} does not carry a component task",
                command.name()
            )));
        };

        let request = LockRequest::new(
            format!("component-{}", task.component),
            command.command_id.to_string(),
        );
        let started = Mutex::new(None);
        let outcome = with_lock(self.locks.clone(), &request, |_| {
            self.run(task.clone(), &started)
        })
        .await;

        let resource_id = started.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(resource_id) = resource_id {
            if let Err(e) = self.runner.terminate(&resource_id).await {
                warn!(task_id = %task.id, resource_id = %resource_id, error = %e, "failed to terminate component task runner");
            }
        }
        let (task, error) = outcome?;

        if let Some(error) = error {
            result.add_error(CommandError::from_error(&error));
        } else if task.resource_state == ResourceState::Failed {
            let message = match task.exit_code {
                Some(code) => format!("component task failed with exit code {code}"),
                None => "component task failed".to_string(),
            };
            result.add_error(CommandError::error(message));
        }

        let value = serde_json::to_value(&task)
            .map_err(|e| HandlerError::failed(format!("component task serialization: {e}")))?;
        result.set_result(value);
        Ok(result)
    }
}
