use thiserror::Error;

/// Authorization store failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for AuthStoreError {
    fn from(value: serde_json::Error) -> Self {
        AuthStoreError::Serialization(value.to_string())
    }
}
