//! `teamcloud-adapters` — the contract every provider adapter satisfies.
//!
//! An adapter is bound to exactly one [`DeploymentScopeType`] and implements
//! the component lifecycle for it. Optional capabilities are separate traits
//! an adapter opts into by returning itself from [`Adapter::as_authorizable`]
//! or [`Adapter::as_identity_issuer`].
//!
//! [`DeploymentScopeType`]: teamcloud_core::DeploymentScopeType

pub mod adapter;
pub mod authorize;
pub mod error;
pub mod identity;
pub mod registry;
pub mod scope;

pub use adapter::{display_name_for, Adapter};
pub use authorize::{Authorizable, AuthorizationFlow};
pub use error::AdapterError;
pub use identity::{
    service_principal_name, DirectoryService, IdentityIssuer, InMemoryDirectory,
    InMemorySecretStore, SecretStore, ServiceIdentityManager, ServicePrincipal,
};
pub use registry::AdapterRegistry;
pub use scope::{DeploymentScopeRepository, InMemoryDeploymentScopes};
