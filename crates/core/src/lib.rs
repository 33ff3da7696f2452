//! `teamcloud-core` — control plane foundation building blocks.
//!
//! This crate contains identifiers, the domain error model and the domain
//! entities that travel as command payloads. It has no infrastructure concerns.

pub mod entity;
pub mod error;
pub mod id;
pub mod resource;

pub use entity::{
    Component, ComponentTask, ComponentTaskType, DeploymentScope, DeploymentScopeType, Entity,
    Organization, Project, User, UserRole,
};
pub use error::{DomainError, DomainResult};
pub use id::{
    combine_ids, path_segment_safe, CommandId, ComponentId, ComponentTaskId, DeploymentScopeId,
    OrganizationId, ProjectId, UserId,
};
pub use resource::ResourceState;
