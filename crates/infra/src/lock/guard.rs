use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

use super::manager::{DistributedLockManager, LockHandle};
use super::LockError;

/// Parameters for acquiring a lock with waiting.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub key: String,
    pub owner_id: String,
    pub lease_period: Duration,
    /// How long to keep trying before giving up with `LockError::Timeout`.
    pub wait: Duration,
    pub backoff: RetryPolicy,
}

impl LockRequest {
    pub fn new(key: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner_id: owner_id.into(),
            lease_period: Duration::from_secs(60),
            wait: Duration::from_secs(60),
            backoff: RetryPolicy::exponential(u32::MAX, Duration::from_millis(200), Duration::from_secs(5)),
        }
    }

    pub fn with_lease_period(mut self, period: Duration) -> Self {
        self.lease_period = period;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// A held lock whose lease is renewed in the background.
///
/// Renewal runs at half the lease period, or a sixth of it after a transient
/// failure. If the lease is lost the guard flips to lost and [`LockGuard::lost`]
/// resolves. Dropping the guard releases the lease best-effort.
pub struct LockGuard {
    manager: Arc<dyn DistributedLockManager>,
    handle: LockHandle,
    lost: watch::Receiver<bool>,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Start keeping `handle` alive.
    pub fn keep_alive(manager: Arc<dyn DistributedLockManager>, handle: LockHandle) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let renewal = tokio::spawn(renew_loop(manager.clone(), handle.clone(), lost_tx));
        Self {
            manager,
            handle,
            lost: lost_rx,
            renewal: Some(renewal),
            released: false,
        }
    }

    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the lease has been lost. Never resolves while it is held.
    pub async fn lost(&self) {
        let mut rx = self.lost.clone();
        let signalled = rx.wait_for(|lost| *lost).await.map(|_| ());
        if signalled.is_err() {
            // Renewal task ended without reporting a loss (released).
            std::future::pending::<()>().await;
        }
    }

    /// Stop renewing and release the lease.
    pub async fn release(mut self) -> bool {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
        self.released = true;
        self.manager.release(&self.handle).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(task) = self.renewal.take() {
            task.abort();
        }
        if self.released {
            return;
        }
        // Without a runtime the lease simply expires.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.manager.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            manager.release(&handle).await;
        });
    }
}

async fn renew_loop(
    manager: Arc<dyn DistributedLockManager>,
    handle: LockHandle,
    lost: watch::Sender<bool>,
) {
    let normal = handle.lease_period / 2;
    let sooner = handle.lease_period / 6;
    let mut wait = normal;

    loop {
        tokio::time::sleep(wait).await;
        match manager.renew(&handle).await {
            Ok(true) => wait = normal,
            Ok(false) => wait = sooner,
            Err(LockError::LeaseLost { .. }) => {
                warn!(lock_key = %handle.key, "lease lost; signalling holder");
                let _ = lost.send(true);
                return;
            }
            Err(e) => {
                warn!(lock_key = %handle.key, error = %e, "lease renewal error");
                wait = sooner;
            }
        }
    }
}

/// Acquire a lock, retrying with backoff until `request.wait` elapses.
pub async fn acquire(
    manager: Arc<dyn DistributedLockManager>,
    request: &LockRequest,
) -> Result<LockGuard, LockError> {
    let deadline = Instant::now() + request.wait;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(handle) = manager
            .try_lock(&request.key, &request.owner_id, None, request.lease_period)
            .await?
        {
            return Ok(LockGuard::keep_alive(manager, handle));
        }

        let delay = request.backoff.delay_for_attempt(attempt);
        if Instant::now() + delay > deadline {
            return Err(LockError::Timeout {
                key: request.key.clone(),
            });
        }
        debug!(lock_key = %request.key, attempt, "lock busy; waiting");
        tokio::time::sleep(delay).await;
    }
}

/// Run `f` while holding the lock.
///
/// The critical section is abandoned with `LockError::LeaseLost` if the lease
/// is lost before `f` completes.
pub async fn with_lock<F, Fut, T>(
    manager: Arc<dyn DistributedLockManager>,
    request: &LockRequest,
    f: F,
) -> Result<T, LockError>
where
    F: FnOnce(LockHandle) -> Fut,
    Fut: Future<Output = T>,
{
    let guard = acquire(manager, request).await?;
    let outcome = tokio::select! {
        value = f(guard.handle().clone()) => Ok(value),
        _ = guard.lost() => Err(LockError::LeaseLost { key: request.key.clone() }),
    };
    guard.release().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::BlobLeaseLockManager;
    use crate::storage::{BlobStore, MemoryBlobStore};

    fn locks() -> (Arc<MemoryBlobStore>, Arc<dyn DistributedLockManager>) {
        let store = MemoryBlobStore::arc();
        (store.clone(), Arc::new(BlobLeaseLockManager::new(store)))
    }

    #[tokio::test(start_paused = true)]
    async fn guard_keeps_lease_alive_past_its_period() {
        let (_, locks) = locks();
        let request = LockRequest::new("k", "a").with_lease_period(Duration::from_secs(15));
        let guard = acquire(locks.clone(), &request).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!guard.is_lost());
        assert_eq!(locks.get_owner("k").await.unwrap(), Some("a".to_string()));

        assert!(guard.release().await);
        assert_eq!(locks.get_owner("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_held() {
        let (_, locks) = locks();
        let _held = acquire(locks.clone(), &LockRequest::new("k", "a")).await.unwrap();

        let err = acquire(
            locks.clone(),
            &LockRequest::new("k", "b").with_wait(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn broken_lease_aborts_critical_section() {
        let (store, locks) = locks();
        let request = LockRequest::new("k", "a").with_lease_period(Duration::from_secs(15));

        let breaker = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            breaker
                .break_lease(crate::lock::LOCK_CONTAINER, "locks/k")
                .await
                .unwrap();
        });

        let outcome = with_lock(locks, &request, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            "finished"
        })
        .await;

        assert!(matches!(outcome, Err(LockError::LeaseLost { .. })));
    }

    #[tokio::test]
    async fn with_lock_releases_after_success() {
        let (_, locks) = locks();
        let value = with_lock(locks.clone(), &LockRequest::new("k", "a"), |handle| async move {
            handle.owner_id.clone()
        })
        .await
        .unwrap();

        assert_eq!(value, "a");
        assert_eq!(locks.get_owner("k").await.unwrap(), None);
    }
}
