use thiserror::Error;

use teamcloud_auth::AuthStoreError;
use teamcloud_core::{DeploymentScopeId, DeploymentScopeType};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("an adapter for deployment scope type {0} is already registered")]
    DuplicateScopeType(DeploymentScopeType),

    #[error("no adapter registered for deployment scope type {0}")]
    UnsupportedScopeType(DeploymentScopeType),

    #[error("deployment scope {0} not found")]
    ScopeNotFound(DeploymentScopeId),

    #[error("{adapter} is not authorized for deployment scope {scope}")]
    NotAuthorized {
        adapter: String,
        scope: DeploymentScopeId,
    },

    #[error("no active authorization session")]
    SessionNotFound,

    #[error("authorization state does not match the active session")]
    StateMismatch,

    #[error("{0} is not supported by this adapter")]
    NotSupported(&'static str),

    #[error("authorization store error: {0}")]
    Store(#[from] AuthStoreError),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("secret store error: {0}")]
    Secrets(String),

    /// Failure reported by the external system behind the adapter.
    #[error("{0}")]
    Provider(String),
}

impl AdapterError {
    pub fn provider(msg: impl Into<String>) -> Self {
        AdapterError::Provider(msg.into())
    }
}
