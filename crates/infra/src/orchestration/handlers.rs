//! Routing of commands to local handlers and remote providers.
//!
//! Both tables are keyed by command name patterns: an exact name, a
//! `Prefix*` wildcard (longest prefix wins) or `*` as fallback.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use teamcloud_adapters::{AdapterError, AdapterRegistry, DeploymentScopeRepository};
use teamcloud_commands::{Command, CommandAction, CommandPayload, CommandResult};
use teamcloud_core::{Component, DomainError};

use crate::dispatch::ProviderEndpoint;
use crate::lock::LockError;
use crate::monitoring::MonitorError;

/// Failure of a local command handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Executes a command inside the engine process.
///
/// The handler receives the engine's current result and returns the updated
/// one. Returning an error records it on the result, which fails the command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: &Command,
        result: CommandResult,
    ) -> Result<CommandResult, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command, CommandResult) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CommandResult, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        command: &Command,
        result: CommandResult,
    ) -> Result<CommandResult, HandlerError> {
        (self.0)(command.clone(), result).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command, CommandResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResult, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone)]
struct PatternMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for PatternMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> PatternMap<T> {
    fn insert(&mut self, pattern: String, value: T) {
        match self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((pattern, value)),
        }
    }

    fn resolve(&self, name: &str) -> Option<&T> {
        if let Some((_, v)) = self.entries.iter().find(|(p, _)| p == name) {
            return Some(v);
        }

        let prefixed = self
            .entries
            .iter()
            .filter_map(|(p, v)| {
                let prefix = p.strip_suffix('*')?;
                (!prefix.is_empty() && name.starts_with(prefix)).then_some((prefix.len(), v))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, v)| v);
        if prefixed.is_some() {
            return prefixed;
        }

        self.entries.iter().find(|(p, _)| p == "*").map(|(_, v)| v)
    }

    fn patterns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }
}

/// Local handlers by command name pattern.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: PatternMap<Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.patterns()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn with(mut self, pattern: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(pattern, handler);
        self
    }

    pub fn resolve(&self, command_name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.resolve(command_name).cloned()
    }
}

/// Remote providers by command name pattern.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    providers: PatternMap<ProviderEndpoint>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: impl Into<String>, provider: ProviderEndpoint) {
        self.providers.insert(pattern.into(), provider);
    }

    pub fn with(mut self, pattern: impl Into<String>, provider: ProviderEndpoint) -> Self {
        self.register(pattern, provider);
        self
    }

    pub fn resolve(&self, command_name: &str) -> Option<&ProviderEndpoint> {
        self.providers.resolve(command_name)
    }
}

/// Runs component lifecycle commands through the adapter of the component's
/// deployment scope.
#[derive(Clone)]
pub struct AdapterCommandHandler {
    adapters: AdapterRegistry,
    scopes: Arc<dyn DeploymentScopeRepository>,
}

impl std::fmt::Debug for AdapterCommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCommandHandler")
            .field("adapters", &self.adapters)
            .finish_non_exhaustive()
    }
}

impl AdapterCommandHandler {
    pub fn new(adapters: AdapterRegistry, scopes: Arc<dyn DeploymentScopeRepository>) -> Self {
        Self { adapters, scopes }
    }
}

#[async_trait]
impl CommandHandler for AdapterCommandHandler {
    async fn handle(
        &self,
        command: &Command,
        mut result: CommandResult,
    ) -> Result<CommandResult, HandlerError> {
        let CommandPayload::Component(component) = &command.payload else {
            return Err(HandlerError::failed(format!(
                "{} does not carry a component",
                command.name()
            )));
        };

        let scope = self
            .scopes
            .get(component.organization, component.deployment_scope)
            .await?
            .ok_or(AdapterError::ScopeNotFound(component.deployment_scope))?;
        let adapter = self.adapters.get(scope.scope_type)?;

        if !adapter.is_authorized(&scope).await? {
            return Err(AdapterError::NotAuthorized {
                adapter: adapter.display_name(),
                scope: scope.id,
            }
            .into());
        }

        info!(
            command_id = %command.command_id,
            component_id = %component.id,
            scope_type = %scope.scope_type,
            action = ?command.action,
            "running component command through adapter"
        );

        let updated: Component = match command.action {
            CommandAction::Create => adapter.create_component(component, &command.user).await?,
            CommandAction::Update => adapter.update_component(component, &command.user).await?,
            CommandAction::Delete => adapter.delete_component(component, &command.user).await?,
            CommandAction::Custom => {
                return Err(AdapterError::NotSupported("custom component commands").into());
            }
        };

        let value = serde_json::to_value(&updated)
            .map_err(|e| HandlerError::failed(format!("component serialization: {e}")))?;
        result.set_result(value);
        Ok(result)
    }
}
