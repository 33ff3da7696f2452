use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use teamcloud_core::{
    CommandId, Component, ComponentTask, DeploymentScope, Entity, Organization, OrganizationId,
    Project, ProjectId, User,
};

use crate::error::CommandValidationError;

/// What a command does to its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandAction {
    Custom,
    Create,
    Update,
    Delete,
}

impl core::fmt::Display for CommandAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            CommandAction::Custom => "Custom",
            CommandAction::Create => "Create",
            CommandAction::Update => "Update",
            CommandAction::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// The domain object a command acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CommandPayload {
    Organization(Organization),
    Project(Project),
    User(User),
    DeploymentScope(DeploymentScope),
    Component(Component),
    ComponentTask(ComponentTask),
    /// Free-form payload for commands without a typed entity.
    Custom { name: String, data: JsonValue },
}

impl CommandPayload {
    /// Entity type name (`Project`, `ComponentTask`, ...), or the custom name.
    pub fn type_name(&self) -> &str {
        match self {
            CommandPayload::Organization(_) => Organization::entity_name(),
            CommandPayload::Project(_) => Project::entity_name(),
            CommandPayload::User(_) => User::entity_name(),
            CommandPayload::DeploymentScope(_) => DeploymentScope::entity_name(),
            CommandPayload::Component(_) => Component::entity_name(),
            CommandPayload::ComponentTask(_) => ComponentTask::entity_name(),
            CommandPayload::Custom { name, .. } => name.as_str(),
        }
    }

    fn static_name(&self) -> &'static str {
        match self {
            CommandPayload::Organization(_) => Organization::entity_name(),
            CommandPayload::Project(_) => Project::entity_name(),
            CommandPayload::User(_) => User::entity_name(),
            CommandPayload::DeploymentScope(_) => DeploymentScope::entity_name(),
            CommandPayload::Component(_) => Component::entity_name(),
            CommandPayload::ComponentTask(_) => ComponentTask::entity_name(),
            CommandPayload::Custom { .. } => "Custom",
        }
    }

    /// Organization the payload belongs to, when the payload carries one.
    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            CommandPayload::Organization(o) => Some(o.id),
            CommandPayload::Project(p) => Some(p.organization),
            CommandPayload::User(u) => Some(u.organization),
            CommandPayload::DeploymentScope(s) => Some(s.organization),
            CommandPayload::Component(c) => Some(c.organization),
            CommandPayload::ComponentTask(t) => Some(t.organization),
            CommandPayload::Custom { .. } => None,
        }
    }

    /// Project the payload is scoped to, when it is project-scoped.
    pub fn project_id(&self) -> Option<ProjectId> {
        match self {
            CommandPayload::Project(p) => Some(p.id),
            CommandPayload::Component(c) => Some(c.project),
            CommandPayload::ComponentTask(t) => Some(t.project),
            _ => None,
        }
    }

    fn supports(&self, action: CommandAction) -> bool {
        use CommandAction::*;
        match self {
            CommandPayload::ComponentTask(_) => matches!(action, Create | Custom),
            CommandPayload::Custom { .. } => true,
            _ => matches!(action, Create | Update | Delete),
        }
    }
}

/// A request to perform one state-changing operation.
///
/// Commands are immutable once created. A command with a `project_id` is
/// serialized against every other command sharing that project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: CommandId,
    #[serde(default)]
    pub parent_id: Option<CommandId>,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub action: CommandAction,
    pub user: User,
    pub payload: CommandPayload,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
}

impl Command {
    /// Create a command; organization and project are taken from the payload
    /// when it carries them, otherwise from the acting user.
    pub fn new(action: CommandAction, user: User, payload: CommandPayload) -> Self {
        let organization_id = payload.organization_id().unwrap_or(user.organization);
        let project_id = payload.project_id();
        Self {
            command_id: CommandId::new(),
            parent_id: None,
            organization_id,
            project_id,
            action,
            user,
            payload,
            created: Utc::now(),
        }
    }

    pub fn with_command_id(mut self, command_id: CommandId) -> Self {
        self.command_id = command_id;
        self
    }

    pub fn with_parent(mut self, parent: CommandId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Canonical command name, e.g. `ProjectCreateCommand`.
    ///
    /// Custom component task commands are runs (`ComponentTaskRunCommand`);
    /// custom payloads use their own name.
    pub fn name(&self) -> String {
        match (&self.payload, self.action) {
            (CommandPayload::Custom { name, .. }, _) => name.clone(),
            (CommandPayload::ComponentTask(_), CommandAction::Custom) => {
                "ComponentTaskRunCommand".to_string()
            }
            (payload, action) => format!("{}{}Command", payload.static_name(), action),
        }
    }

    pub fn is_project_scoped(&self) -> bool {
        self.project_id.is_some()
    }

    /// Structural checks performed before a command is accepted.
    pub fn validate(&self) -> Result<(), CommandValidationError> {
        if self.command_id.is_nil() {
            return Err(CommandValidationError::MissingIdentifier("commandId"));
        }
        if self.organization_id.is_nil() {
            return Err(CommandValidationError::MissingIdentifier("organizationId"));
        }
        if self.user.id.is_nil() {
            return Err(CommandValidationError::MissingIdentifier("user"));
        }
        if self.parent_id == Some(self.command_id) {
            return Err(CommandValidationError::ScopeMismatch(
                "command cannot be its own parent".to_string(),
            ));
        }

        if let Some(org) = self.payload.organization_id() {
            if org != self.organization_id {
                return Err(CommandValidationError::ScopeMismatch(format!(
                    "payload organization {org} does not match command organization {}",
                    self.organization_id
                )));
            }
        }

        match (self.payload.project_id(), self.project_id) {
            (Some(_), None) => {
                return Err(CommandValidationError::MissingIdentifier("projectId"));
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(CommandValidationError::ScopeMismatch(format!(
                    "payload project {expected} does not match command project {actual}"
                )));
            }
            _ => {}
        }

        if !self.payload.supports(self.action) {
            return Err(CommandValidationError::NotSupported {
                action: self.action.to_string(),
                payload: self.payload.static_name(),
            });
        }

        Ok(())
    }
}
