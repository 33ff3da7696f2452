//! Storage substrate: blob objects (with leases) and indexed table rows.
//!
//! Both abstractions are deliberately narrow. They carry exactly what the
//! lock manager, the audit trail and the authorization stores need, and the
//! in-memory backends implement the same semantics a cloud backend would
//! (lease conflicts, conditional writes, continuation-token paging).

pub mod blob;
pub mod memory;
pub mod table;

pub use blob::{BlobProperties, BlobStore, LeaseState, WritePrecondition, WriteResult};
pub use memory::{MemoryBlobStore, MemoryTableStore};
pub use table::{Filter, OrderBy, TableEntity, TablePage, TableQuery, TableStore};

use thiserror::Error;

/// Storage operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The object or row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lease is currently held by someone else.
    #[error("lease conflict: {0}")]
    LeaseConflict(String),

    /// The lease presented is no longer valid (expired, broken, or taken over).
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Server side failure; the operation may succeed when retried.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub(crate) fn poisoned() -> Self {
        StorageError::Other("lock poisoned".to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Serialization(value.to_string())
    }
}
