//! Distributed Lock Manager.
//!
//! Leases on blobs give single-writer semantics for lower-level resource
//! contention (one-time provisioning, container runs). Command ordering per
//! project does not use these locks; see the orchestration serializer.

pub mod guard;
pub mod manager;

pub use guard::{acquire, with_lock, LockGuard, LockRequest};
pub use manager::{
    BlobLeaseLockManager, DistributedLockManager, LockHandle, LOCK_CONTAINER, OWNER_METADATA_KEY,
};

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lease is gone; the critical section is no longer exclusive.
    #[error("lease lost for lock {key}")]
    LeaseLost { key: String },

    #[error("timed out waiting for lock {key}")]
    Timeout { key: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
