//! Domain entities carried as command payloads.
//!
//! Entities are plain serialisable records. Ownership is expressed through
//! explicit parent identifiers (organization, project, component) rather than
//! back references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{
    ComponentId, ComponentTaskId, DeploymentScopeId, OrganizationId, ProjectId, UserId,
};
use crate::resource::ResourceState;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Entity type name as used in command names (e.g. `Project`).
    fn entity_name() -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: OrganizationId,
    pub slug: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub organization: OrganizationId,
    pub display_name: String,
    #[serde(default)]
    pub resource_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UserRole {
    #[default]
    None,
    Member,
    Admin,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub organization: OrganizationId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub role: UserRole,
}

/// Kind of external integration a deployment scope targets.
///
/// Exactly one adapter is registered per scope type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeploymentScopeType {
    AzureResourceManager,
    AzureDevOps,
    GitHub,
    Kubernetes,
}

impl DeploymentScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentScopeType::AzureResourceManager => "AzureResourceManager",
            DeploymentScopeType::AzureDevOps => "AzureDevOps",
            DeploymentScopeType::GitHub => "GitHub",
            DeploymentScopeType::Kubernetes => "Kubernetes",
        }
    }
}

impl core::fmt::Display for DeploymentScopeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentScope {
    pub id: DeploymentScopeId,
    pub organization: OrganizationId,
    pub display_name: String,
    #[serde(rename = "type")]
    pub scope_type: DeploymentScopeType,
    /// Adapter specific settings (endpoints, installation ids, ...).
    #[serde(default)]
    pub input_data: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub id: ComponentId,
    pub organization: OrganizationId,
    pub project: ProjectId,
    pub deployment_scope: DeploymentScopeId,
    pub display_name: String,
    /// Identifier of the provisioned resource, once known.
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_state: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComponentTaskType {
    Create,
    Delete,
    #[default]
    Custom,
}

/// A single run of a component task (typically a container job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentTask {
    pub id: ComponentTaskId,
    pub organization: OrganizationId,
    pub project: ProjectId,
    pub component: ComponentId,
    #[serde(default)]
    pub task_type: ComponentTaskType,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_state: ResourceState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Accumulated output (container events, deployment outputs).
    #[serde(default)]
    pub output: Vec<String>,
}

macro_rules! impl_entity {
    ($t:ty, $id:ty, $name:literal) => {
        impl Entity for $t {
            type Id = $id;

            fn id(&self) -> &Self::Id {
                &self.id
            }

            fn entity_name() -> &'static str {
                $name
            }
        }
    };
}

impl_entity!(Organization, OrganizationId, "Organization");
impl_entity!(Project, ProjectId, "Project");
impl_entity!(User, UserId, "User");
impl_entity!(DeploymentScope, DeploymentScopeId, "DeploymentScope");
impl_entity!(Component, ComponentId, "Component");
impl_entity!(ComponentTask, ComponentTaskId, "ComponentTask");
