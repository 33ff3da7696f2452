use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::StorageError;

/// Precondition for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches.
    MatchesVersion(u64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write. A failed precondition is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Success { version: u64 },
    PreconditionFailed { current_version: u64 },
}

impl WriteResult {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteResult::Success { .. })
    }
}

/// Observed lease state of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Never leased or released.
    Available,
    /// A lease is held and has not expired.
    Leased,
    /// The last lease ran out without being released.
    Expired,
    /// The last lease was broken administratively.
    Broken,
}

impl LeaseState {
    /// Whether a new lease can be acquired right now.
    pub fn is_acquirable(&self) -> bool {
        !matches!(self, LeaseState::Leased)
    }
}

/// Blob metadata without content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub size: u64,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    pub lease_state: LeaseState,
    pub metadata: HashMap<String, String>,
}

/// Blob-style object store with leases.
///
/// Leases are exclusive, time-bounded claims on a single blob. Acquisition is
/// atomic in the backend; a lease is identified by a caller-proposed id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads the whole object; `None` when it does not exist.
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>, StorageError>;

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError>;

    /// Deletes an object. Returns whether it existed.
    async fn delete(&self, container: &str, name: &str) -> Result<bool, StorageError>;

    async fn head(&self, container: &str, name: &str)
    -> Result<Option<BlobProperties>, StorageError>;

    /// Acquires a lease.
    ///
    /// Fails with `NotFound` if the blob does not exist and `LeaseConflict`
    /// if another lease is active.
    async fn acquire_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
        period: Duration,
    ) -> Result<(), StorageError>;

    /// Extends a held lease by its original period.
    ///
    /// Fails with `LeaseLost` when `lease_id` no longer holds the blob.
    async fn renew_lease(&self, container: &str, name: &str, lease_id: &str)
    -> Result<(), StorageError>;

    /// Releases a held lease. Fails with `LeaseLost` when `lease_id` does not hold it.
    async fn release_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
    ) -> Result<(), StorageError>;

    /// Ends any lease immediately, whoever holds it.
    async fn break_lease(&self, container: &str, name: &str) -> Result<(), StorageError>;

    /// Replaces the metadata of a blob. When the blob is leased the matching
    /// lease id must be presented.
    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        lease_id: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl<S: BlobStore + ?Sized> BlobStore for Arc<S> {
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>, StorageError> {
        (**self).get(container, name).await
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError> {
        (**self).put(container, name, data, precondition).await
    }

    async fn delete(&self, container: &str, name: &str) -> Result<bool, StorageError> {
        (**self).delete(container, name).await
    }

    async fn head(
        &self,
        container: &str,
        name: &str,
    ) -> Result<Option<BlobProperties>, StorageError> {
        (**self).head(container, name).await
    }

    async fn acquire_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
        period: Duration,
    ) -> Result<(), StorageError> {
        (**self).acquire_lease(container, name, lease_id, period).await
    }

    async fn renew_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
    ) -> Result<(), StorageError> {
        (**self).renew_lease(container, name, lease_id).await
    }

    async fn release_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
    ) -> Result<(), StorageError> {
        (**self).release_lease(container, name, lease_id).await
    }

    async fn break_lease(&self, container: &str, name: &str) -> Result<(), StorageError> {
        (**self).break_lease(container, name).await
    }

    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        lease_id: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        (**self).set_metadata(container, name, lease_id, metadata).await
    }
}
