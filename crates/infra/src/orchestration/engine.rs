use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use teamcloud_commands::{
    Command, CommandError, CommandMessage, CommandResult, RuntimeStatus, STATUS_LINK,
};
use teamcloud_core::{CommandId, OrganizationId};

use crate::audit::{CommandAuditEntity, CommandAuditReader, CommandAuditWriter};
use crate::config::EngineOptions;
use crate::dispatch::{CommandSender, DispatchError, ProviderEndpoint};

use super::handlers::{CommandHandler, HandlerRegistry, ProviderCatalog};
use super::journal::{InMemoryJournal, OrchestrationJournal};
use super::serializer::ProjectSerializer;
use super::EngineError;

const STATUS_AUDITING: &str = "Auditing command";
const STATUS_PROCESSING: &str = "Processing command";
const STATUS_AUGMENTING: &str = "Augmenting command result";
const STATUS_AUDITING_RESULT: &str = "Auditing command result";
const STATUS_SUCCEEDED: &str = "Command succeeded";

pub struct EngineBuilder {
    options: EngineOptions,
    audit: CommandAuditWriter,
    sender: CommandSender,
    reader: Option<CommandAuditReader>,
    handlers: HandlerRegistry,
    providers: ProviderCatalog,
    journal: Option<Arc<dyn OrchestrationJournal>>,
}

impl EngineBuilder {
    pub fn new(options: EngineOptions, audit: CommandAuditWriter, sender: CommandSender) -> Self {
        Self {
            options,
            audit,
            sender,
            reader: None,
            handlers: HandlerRegistry::new(),
            providers: ProviderCatalog::new(),
            journal: None,
        }
    }

    pub fn with_handler(mut self, pattern: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.register(pattern, handler);
        self
    }

    pub fn with_provider(mut self, pattern: impl Into<String>, provider: ProviderEndpoint) -> Self {
        self.providers.register(pattern, provider);
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn OrchestrationJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Lets [`OrchestrationEngine::status`] answer from the audit trail for
    /// commands this process has never seen.
    pub fn with_audit_reader(mut self, reader: CommandAuditReader) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn build(self) -> OrchestrationEngine {
        let serializer = ProjectSerializer::new(self.options.serialization_poll_interval);
        OrchestrationEngine {
            inner: Arc::new(EngineInner {
                options: self.options,
                handlers: self.handlers,
                providers: self.providers,
                sender: self.sender,
                audit: self.audit,
                reader: self.reader,
                journal: self.journal.unwrap_or_else(|| InMemoryJournal::arc()),
                serializer,
                instances: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Runs commands: serializes them per project, routes them to a handler or
/// provider, and records every transition.
#[derive(Clone)]
pub struct OrchestrationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("options", &self.inner.options)
            .field("handlers", &self.inner.handlers)
            .field("providers", &self.inner.providers)
            .finish_non_exhaustive()
    }
}

struct Instance {
    command: Command,
    state: watch::Sender<CommandResult>,
}

struct EngineInner {
    options: EngineOptions,
    handlers: HandlerRegistry,
    providers: ProviderCatalog,
    sender: CommandSender,
    audit: CommandAuditWriter,
    reader: Option<CommandAuditReader>,
    journal: Arc<dyn OrchestrationJournal>,
    serializer: ProjectSerializer,
    instances: Mutex<HashMap<CommandId, Instance>>,
    callbacks: Mutex<HashMap<CommandId, oneshot::Sender<CommandResult>>>,
}

impl OrchestrationEngine {
    pub fn builder(
        options: EngineOptions,
        audit: CommandAuditWriter,
        sender: CommandSender,
    ) -> EngineBuilder {
        EngineBuilder::new(options, audit, sender)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Accept a command and start it in the background.
    ///
    /// Returns the `Pending` snapshot. Project-scoped commands are queued in
    /// the order `submit` is called.
    pub async fn submit(&self, command: Command) -> Result<CommandResult, EngineError> {
        command.validate()?;
        let command_id = command.command_id;
        if self.inner.journal.last(command_id).await?.is_some() {
            return Err(EngineError::Duplicate(command_id));
        }

        let mut result = CommandResult::new(&command);
        if let Some(url) = self.inner.options.status_url(command.organization_id, command_id) {
            result = result.with_link(STATUS_LINK, url);
        }
        result.set_runtime_status(RuntimeStatus::Pending);
        result.set_custom_status(STATUS_AUDITING);

        if !self.inner.register(&command, &result) {
            return Err(EngineError::Duplicate(command_id));
        }
        info!(
            command_id = %command_id,
            command = %command.name(),
            organization_id = %command.organization_id,
            project_id = ?command.project_id,
            "command accepted"
        );

        self.inner.clone().start(command, result.clone());
        Ok(result)
    }

    /// Latest known result of a command.
    ///
    /// Falls back to the journal and then to the audit trail for commands
    /// not running in this process.
    pub async fn status(
        &self,
        organization_id: OrganizationId,
        command_id: CommandId,
    ) -> Result<CommandResult, EngineError> {
        if let Some(result) = self.inner.snapshot(command_id) {
            return if result.organization_id == organization_id {
                Ok(result)
            } else {
                Err(EngineError::NotFound(command_id))
            };
        }

        if let Some(entry) = self.inner.journal.last(command_id).await? {
            if entry.result.organization_id == organization_id {
                return Ok(entry.result);
            }
        }

        if let Some(reader) = &self.inner.reader {
            match reader.get(organization_id, command_id, true).await {
                Ok(Some(entity)) => return Ok(result_from_audit(command_id, organization_id, &entity)),
                Ok(None) => {}
                Err(e) => {
                    warn!(command_id = %command_id, error = %e, "audit lookup failed");
                }
            }
        }

        Err(EngineError::NotFound(command_id))
    }

    /// Wait up to `timeout` for the command to finish and return its latest
    /// snapshot, final or not.
    ///
    /// Finished commands are no longer tracked in memory; their final
    /// snapshot comes from the journal.
    pub async fn wait(
        &self,
        command_id: CommandId,
        timeout: Duration,
    ) -> Result<CommandResult, EngineError> {
        let updates = self
            .inner
            .instances()
            .get(&command_id)
            .map(|instance| instance.state.subscribe());
        let Some(mut updates) = updates else {
            return match self.inner.journal.last(command_id).await? {
                Some(entry) => Ok(entry.result),
                None => Err(EngineError::NotFound(command_id)),
            };
        };

        let finished = match tokio::time::timeout(timeout, updates.wait_for(CommandResult::is_final)).await {
            Ok(Ok(result)) => Some(result.clone()),
            // The instance went away; it published its final snapshot first.
            Ok(Err(_)) => None,
            Err(_) => None,
        };
        Ok(finished.unwrap_or_else(|| updates.borrow().clone()))
    }

    /// Deliver the result an asynchronous provider posted back.
    ///
    /// Returns false when nothing is waiting for `command_id`.
    pub fn complete(&self, command_id: CommandId, result: CommandResult) -> bool {
        if result.command_id != command_id {
            warn!(command_id = %command_id, reported = %result.command_id, "callback result belongs to another command");
            return false;
        }
        let waiting = self.inner.callbacks().remove(&command_id);
        match waiting {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                warn!(command_id = %command_id, "callback for unknown or finished command ignored");
                false
            }
        }
    }

    /// Resume every journaled command that never reached a final status.
    ///
    /// Commands are re-queued in their original order. A provider that
    /// already received a command answers the repeated send with a conflict,
    /// which the dispatcher resolves by fetching the provider's result.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for entry in self.inner.journal.unfinished().await? {
            if !self.inner.register(&entry.command, &entry.result) {
                continue;
            }
            info!(
                command_id = %entry.command.command_id,
                status = %entry.result.runtime_status(),
                "resuming unfinished command"
            );
            self.inner.clone().start(entry.command, entry.result);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Commands of a project, active one first.
    pub fn project_queue(&self, project: teamcloud_core::ProjectId) -> Vec<CommandId> {
        self.inner
            .serializer
            .active(project)
            .into_iter()
            .chain(self.inner.serializer.queued(project))
            .collect()
    }
}

impl EngineInner {
    fn instances(&self) -> MutexGuard<'_, HashMap<CommandId, Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> MutexGuard<'_, HashMap<CommandId, oneshot::Sender<CommandResult>>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a new instance; false if the command is already known.
    fn register(&self, command: &Command, result: &CommandResult) -> bool {
        {
            let mut instances = self.instances();
            if instances.contains_key(&command.command_id) {
                return false;
            }
            let (state, _) = watch::channel(result.clone());
            instances.insert(
                command.command_id,
                Instance {
                    command: command.clone(),
                    state,
                },
            );
        }
        if let Some(project) = command.project_id {
            let ahead = self.serializer.enqueue(project, command.command_id);
            debug!(command_id = %command.command_id, project_id = %project, ahead, "command enqueued");
        }
        true
    }

    fn start(self: Arc<Self>, command: Command, result: CommandResult) {
        tokio::spawn(self.run(command, result));
    }

    fn snapshot(&self, command_id: CommandId) -> Option<CommandResult> {
        self.instances()
            .get(&command_id)
            .map(|instance| instance.state.borrow().clone())
    }

    fn status_of(&self, command_id: CommandId) -> Option<RuntimeStatus> {
        self.instances()
            .get(&command_id)
            .map(|instance| instance.state.borrow().runtime_status())
    }

    fn publish(&self, result: &CommandResult) {
        if let Some(instance) = self.instances().get(&result.command_id) {
            instance.state.send_replace(result.clone());
        }
    }

    async fn record(&self, command: &Command, result: &CommandResult) {
        self.publish(result);
        if let Err(e) = self.journal.append(command, result).await {
            warn!(command_id = %command.command_id, error = %e, "failed to journal command transition");
        }
        self.audit.write_or_log(command, Some(result)).await;
    }

    async fn run(self: Arc<Self>, command: Command, mut result: CommandResult) {
        let command_id = command.command_id;

        result.set_runtime_status(RuntimeStatus::Pending);
        result.set_custom_status(STATUS_AUDITING);
        self.record(&command, &result).await;

        if let Some(project) = command.project_id {
            self.serializer
                .wait_turn(project, command_id, |other| self.status_of(other))
                .await;
        }

        result.set_runtime_status(RuntimeStatus::Running);
        result.set_custom_status(STATUS_PROCESSING);
        self.record(&command, &result).await;

        let routed = tokio::spawn({
            let inner = self.clone();
            let command = command.clone();
            let running = result.clone();
            async move { inner.route(&command, running).await }
        });
        result = match routed.await {
            Ok(Ok(updated)) => updated,
            Ok(Err(e)) => {
                warn!(command_id = %command_id, error = %e, "command processing failed");
                result.add_error(CommandError::from_error(&e));
                result
            }
            Err(e) => {
                warn!(command_id = %command_id, error = %e, "command processing aborted");
                result.add_error(CommandError::error(format!("command processing aborted: {e}")));
                result
            }
        };
        self.callbacks().remove(&command_id);

        result.set_custom_status(STATUS_AUGMENTING);
        self.augment(&command, &mut result);
        self.publish(&result);

        result.set_custom_status(STATUS_AUDITING_RESULT);
        finalize(&mut result);
        self.record(&command, &result).await;

        if let Some(project) = command.project_id {
            self.serializer.complete(project, command_id);
        }
        self.instances().remove(&command_id);
        info!(
            command_id = %command_id,
            status = %result.runtime_status(),
            "command finished"
        );
    }

    async fn route(
        &self,
        command: &Command,
        result: CommandResult,
    ) -> Result<CommandResult, EngineError> {
        let name = command.name();
        let max = self.options.max_command_timeout;

        if let Some(handler) = self.handlers.resolve(&name) {
            debug!(command_id = %command.command_id, command = %name, "running local handler");
            return match tokio::time::timeout(max, handler.handle(command, result)).await {
                Ok(outcome) => Ok(outcome?),
                Err(_) => Err(EngineError::Timeout { after: max }),
            };
        }

        match self.providers.resolve(&name) {
            Some(provider) => self.dispatch(command, result, provider).await,
            None => Err(EngineError::NoRoute(name)),
        }
    }

    fn register_callback(&self, command_id: CommandId) -> oneshot::Receiver<CommandResult> {
        let (sender, receiver) = oneshot::channel();
        self.callbacks().insert(command_id, sender);
        receiver
    }

    async fn dispatch(
        &self,
        command: &Command,
        mut result: CommandResult,
        provider: &ProviderEndpoint,
    ) -> Result<CommandResult, EngineError> {
        let command_id = command.command_id;
        let max = self.options.max_command_timeout;
        let deadline = Instant::now() + max;

        let message = CommandMessage::new(command.clone(), self.options.callback_url(command_id));
        let mut callback = self.register_callback(command_id);

        let reported = tokio::time::timeout(max, self.sender.send(provider, &message))
            .await
            .map_err(|_| DispatchError::Timeout {
                provider: provider.id.clone(),
                after: max,
            })??;
        result.absorb(reported);
        if result.is_final() {
            return Ok(result);
        }

        let wait = provider.callback_timeout(result.timeout(), max);
        let callback_deadline = (Instant::now() + wait).min(deadline);
        info!(
            command_id = %command_id,
            provider_id = %provider.id,
            wait_secs = wait.as_secs(),
            "waiting for provider callback"
        );

        while !result.is_final() {
            match tokio::time::timeout_at(callback_deadline, &mut callback).await {
                Ok(Ok(reported)) => {
                    result.absorb(reported);
                    if !result.is_final() {
                        callback = self.register_callback(command_id);
                    }
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }

        if !result.is_final() {
            match self
                .sender
                .fetch(provider, command_id, command.organization_id)
                .await
            {
                Ok(reported) => {
                    result.absorb(reported);
                }
                Err(e) => {
                    warn!(command_id = %command_id, provider_id = %provider.id, error = %e, "final status fetch failed");
                }
            }
        }

        if !result.is_final() {
            warn!(command_id = %command_id, provider_id = %provider.id, "provider did not finish in time");
            result.add_error(CommandError::from_error(&DispatchError::Timeout {
                provider: provider.id.clone(),
                after: wait,
            }));
        }
        Ok(result)
    }

    fn augment(&self, command: &Command, result: &mut CommandResult) {
        if let Some(url) = self
            .options
            .status_url(command.organization_id, command.command_id)
        {
            result.links.entry(STATUS_LINK.to_string()).or_insert(url);
        }
    }
}

/// Settle the final status and its custom status text.
fn finalize(result: &mut CommandResult) {
    if result.has_errors() {
        result.set_runtime_status(RuntimeStatus::Failed);
        let message = result
            .errors()
            .iter()
            .filter(|e| e.is_error())
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        result.set_custom_status(format!("Command failed: {message}"));
        return;
    }

    if !result.is_final() {
        result.set_runtime_status(RuntimeStatus::Completed);
    }
    match result.runtime_status() {
        RuntimeStatus::Completed => result.set_custom_status(STATUS_SUCCEEDED),
        other => result.set_custom_status(format!(
            "Command failed: command was {}",
            other.as_str().to_lowercase()
        )),
    }
}

/// Rebuild a result from its audit row, preferring the full JSON dump unless
/// the row saw a later update.
fn result_from_audit(
    command_id: CommandId,
    organization_id: OrganizationId,
    entity: &CommandAuditEntity,
) -> CommandResult {
    let dump = entity
        .result_json
        .as_deref()
        .and_then(|json| serde_json::from_str::<CommandResult>(json).ok());
    if let Some(result) = dump {
        let behind = matches!(
            (result.last_updated_time, entity.updated),
            (Some(dumped), Some(row)) if dumped < row
        );
        if !behind {
            return result;
        }
    }

    let mut result = CommandResult::for_command(command_id, organization_id);
    result.set_runtime_status(entity.runtime_status);
    if !entity.custom_status.is_empty() {
        result.custom_status = Some(entity.custom_status.clone());
    }
    result.add_errors(
        entity
            .errors
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_error_line),
    );
    result.created_time = entity.created;
    result.last_updated_time = entity.updated;
    result
}

fn parse_error_line(line: &str) -> CommandError {
    let line = line.trim();
    if let Some(message) = line.strip_prefix("[Warning] ") {
        CommandError::warning(message)
    } else if let Some(message) = line.strip_prefix("[Error] ") {
        CommandError::error(message)
    } else {
        CommandError::error(line)
    }
}
