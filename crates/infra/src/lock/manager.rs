use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{BlobStore, StorageError, WritePrecondition};

use super::LockError;

/// Container holding lock blobs.
pub const LOCK_CONTAINER: &str = "distributed-locks";

/// Blob metadata key carrying the owner of the current lease.
pub const OWNER_METADATA_KEY: &str = "OwnerId";

/// A held lease on a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub lease_id: String,
    pub owner_id: String,
    pub lease_period: Duration,
    pub acquired_at: DateTime<Utc>,
}

/// Cooperative, renewable locks on arbitrary keys.
///
/// Contention is not an error: `try_lock` returns `None` when someone else
/// holds the key.
#[async_trait]
pub trait DistributedLockManager: Send + Sync {
    /// Try to take the lock once. A `proposed_lease_id` makes re-acquisition by
    /// the same holder idempotent; otherwise a fresh id is generated.
    async fn try_lock(
        &self,
        key: &str,
        owner_id: &str,
        proposed_lease_id: Option<&str>,
        lease_period: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Extend the lease.
    ///
    /// `Ok(false)` means a transient backend failure: retry sooner. A lost
    /// lease is `Err(LockError::LeaseLost)` and must end the critical section.
    async fn renew(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Release the lease. Releasing an expired or already released lease is a
    /// no-op that returns `false`.
    async fn release(&self, handle: &LockHandle) -> bool;

    /// Owner recorded for the current lease, `None` while the key is unlocked.
    async fn get_owner(&self, key: &str) -> Result<Option<String>, LockError>;
}

#[async_trait]
impl<M: DistributedLockManager + ?Sized> DistributedLockManager for Arc<M> {
    async fn try_lock(
        &self,
        key: &str,
        owner_id: &str,
        proposed_lease_id: Option<&str>,
        lease_period: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        (**self)
            .try_lock(key, owner_id, proposed_lease_id, lease_period)
            .await
    }

    async fn renew(&self, handle: &LockHandle) -> Result<bool, LockError> {
        (**self).renew(handle).await
    }

    async fn release(&self, handle: &LockHandle) -> bool {
        (**self).release(handle).await
    }

    async fn get_owner(&self, key: &str) -> Result<Option<String>, LockError> {
        (**self).get_owner(key).await
    }
}

/// Lock manager backed by blob leases.
///
/// Every key maps to an (initially empty) blob `locks/{key}`; holding the
/// lock means holding that blob's lease.
#[derive(Debug, Clone)]
pub struct BlobLeaseLockManager<B> {
    store: B,
    container: String,
}

impl<B: BlobStore> BlobLeaseLockManager<B> {
    pub fn new(store: B) -> Self {
        Self {
            store,
            container: LOCK_CONTAINER.to_string(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    fn blob_name(key: &str) -> String {
        format!("locks/{}", key.trim_matches('/'))
    }

    async fn create_placeholder(&self, name: &str) -> Result<(), LockError> {
        // Losing the creation race is fine: the blob exists either way.
        self.store
            .put(&self.container, name, Bytes::new(), WritePrecondition::DoesNotExist)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<B: BlobStore> DistributedLockManager for BlobLeaseLockManager<B> {
    async fn try_lock(
        &self,
        key: &str,
        owner_id: &str,
        proposed_lease_id: Option<&str>,
        lease_period: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let name = Self::blob_name(key);
        let lease_id = proposed_lease_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Read first to avoid a flood of conflicts under contention.
        if let Some(props) = self.store.head(&self.container, &name).await? {
            if !props.lease_state.is_acquirable()
                && props.metadata.get(OWNER_METADATA_KEY).map(String::as_str) != Some(owner_id)
            {
                debug!(lock_key = %key, "lock is held; not attempting acquisition");
                return Ok(None);
            }
        }

        let mut created = false;
        loop {
            match self
                .store
                .acquire_lease(&self.container, &name, &lease_id, lease_period)
                .await
            {
                Ok(()) => break,
                Err(StorageError::NotFound(_)) if !created => {
                    self.create_placeholder(&name).await?;
                    created = true;
                }
                Err(StorageError::LeaseConflict(_)) => {
                    debug!(lock_key = %key, "lock acquisition lost to another holder");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let metadata = HashMap::from([(OWNER_METADATA_KEY.to_string(), owner_id.to_string())]);
        if let Err(e) = self
            .store
            .set_metadata(&self.container, &name, Some(&lease_id), metadata)
            .await
        {
            let _ = self
                .store
                .release_lease(&self.container, &name, &lease_id)
                .await;
            return Err(e.into());
        }

        info!(lock_key = %key, owner_id = %owner_id, "lock acquired");
        Ok(Some(LockHandle {
            key: key.to_string(),
            lease_id,
            owner_id: owner_id.to_string(),
            lease_period,
            acquired_at: Utc::now(),
        }))
    }

    async fn renew(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let name = Self::blob_name(&handle.key);
        match self
            .store
            .renew_lease(&self.container, &name, &handle.lease_id)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => {
                warn!(lock_key = %handle.key, error = %e, "lock renewal failed; retry sooner");
                Ok(false)
            }
            Err(StorageError::LeaseLost(_)) | Err(StorageError::NotFound(_)) => {
                warn!(lock_key = %handle.key, "lock lease lost");
                Err(LockError::LeaseLost {
                    key: handle.key.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, handle: &LockHandle) -> bool {
        let name = Self::blob_name(&handle.key);
        match self
            .store
            .release_lease(&self.container, &name, &handle.lease_id)
            .await
        {
            Ok(()) => {
                debug!(lock_key = %handle.key, "lock released");
                true
            }
            Err(StorageError::LeaseLost(_)) => false,
            Err(e) => {
                warn!(lock_key = %handle.key, error = %e, "lock release failed");
                false
            }
        }
    }

    async fn get_owner(&self, key: &str) -> Result<Option<String>, LockError> {
        let name = Self::blob_name(key);
        let Some(props) = self.store.head(&self.container, &name).await? else {
            return Ok(None);
        };
        if props.lease_state.is_acquirable() {
            return Ok(None);
        }
        Ok(props.metadata.get(OWNER_METADATA_KEY).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::FaultPoint;
    use crate::storage::MemoryBlobStore;

    const PERIOD: Duration = Duration::from_secs(30);

    fn manager() -> (Arc<MemoryBlobStore>, BlobLeaseLockManager<Arc<MemoryBlobStore>>) {
        let store = MemoryBlobStore::arc();
        (store.clone(), BlobLeaseLockManager::new(store))
    }

    #[tokio::test]
    async fn first_lock_creates_placeholder_and_records_owner() {
        let (store, locks) = manager();

        let handle = locks.try_lock("project/p1", "worker-a", None, PERIOD).await.unwrap();
        let handle = handle.expect("lock should be free");

        assert_eq!(store.list(LOCK_CONTAINER), vec!["locks/project/p1".to_string()]);
        assert_eq!(
            locks.get_owner("project/p1").await.unwrap(),
            Some("worker-a".to_string())
        );
        assert!(locks.release(&handle).await);
        assert_eq!(locks.get_owner("project/p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn contention_returns_none_instead_of_error() {
        let (_, locks) = manager();
        let _held = locks.try_lock("k", "a", None, PERIOD).await.unwrap().unwrap();

        assert!(locks.try_lock("k", "b", None, PERIOD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_, locks) = manager();
        let handle = locks.try_lock("k", "a", None, PERIOD).await.unwrap().unwrap();

        assert!(locks.release(&handle).await);
        assert!(!locks.release(&handle).await);
        assert!(locks.try_lock("k", "b", None, PERIOD).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_acquirable_and_old_holder_loses_renewal() {
        let (_, locks) = manager();
        let old = locks
            .try_lock("k", "a", None, Duration::from_secs(15))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(locks.get_owner("k").await.unwrap(), None);

        let new = locks.try_lock("k", "b", None, PERIOD).await.unwrap();
        assert!(new.is_some());
        assert!(matches!(
            locks.renew(&old).await,
            Err(LockError::LeaseLost { .. })
        ));
        assert!(!locks.release(&old).await);
    }

    #[tokio::test]
    async fn transient_renew_failure_is_soft() {
        let (store, locks) = manager();
        let handle = locks.try_lock("k", "a", None, PERIOD).await.unwrap().unwrap();

        store.fail_next(FaultPoint::RenewLease, 1);
        assert!(!locks.renew(&handle).await.unwrap());
        assert!(locks.renew(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_try_lock_admits_exactly_one() {
        let (_, locks) = manager();
        let locks = Arc::new(locks);

        let attempts = (0..16).map(|i| {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .try_lock("shared", &format!("w{i}"), None, PERIOD)
                    .await
                    .unwrap()
            })
        });

        let results = futures::future::join_all(attempts).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(winners, 1);
    }
}
