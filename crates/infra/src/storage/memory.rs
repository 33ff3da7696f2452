//! In-memory storage backends for tests/dev.
//!
//! Thread-safe via `RwLock`. Lease expiry follows `tokio::time`, so tests can
//! drive it with a paused clock. Transient failures can be injected per
//! operation to exercise retry and fail-open paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;

use super::blob::{BlobProperties, BlobStore, LeaseState, WritePrecondition, WriteResult};
use super::table::{compare, TableEntity, TablePage, TableQuery, TableStore};
use super::StorageError;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BlobGet,
    BlobPut,
    BlobHead,
    AcquireLease,
    RenewLease,
    ReleaseLease,
    SetMetadata,
    TableGet,
    TableUpsert,
    TableQuery,
}

#[derive(Debug, Default)]
struct Faults {
    pending: Mutex<HashMap<FaultPoint, u32>>,
}

impl Faults {
    fn arm(&self, point: FaultPoint, times: u32) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending.entry(point).or_insert(0) += times;
        }
    }

    fn check(&self, point: FaultPoint) -> Result<(), StorageError> {
        let mut pending = self.pending.lock().map_err(|_| StorageError::poisoned())?;
        match pending.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StorageError::Unavailable(format!("injected fault at {point:?}")))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct Lease {
    id: String,
    period: Duration,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    version: u64,
    last_modified: chrono::DateTime<Utc>,
    metadata: HashMap<String, String>,
    lease: Option<Lease>,
    broken: bool,
}

impl StoredBlob {
    fn lease_state(&self, now: Instant) -> LeaseState {
        match &self.lease {
            Some(lease) if lease.expires_at > now => LeaseState::Leased,
            Some(_) => LeaseState::Expired,
            None if self.broken => LeaseState::Broken,
            None => LeaseState::Available,
        }
    }

    fn active_lease(&self, now: Instant) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.expires_at > now)
    }
}

/// In-memory blob store with lease semantics.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    faults: Faults,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `times` calls of `point` fail with a transient error.
    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        self.faults.arm(point, times);
    }

    /// Names of all blobs in a container (sorted).
    pub fn list(&self, container: &str) -> Vec<String> {
        let prefix = format!("{container}/");
        let mut names: Vec<String> = self
            .blobs
            .read()
            .map(|blobs| {
                blobs
                    .keys()
                    .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn blob_key(container: &str, name: &str) -> String {
    format!("{container}/{name}")
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, container: &str, name: &str) -> Result<Option<Bytes>, StorageError> {
        self.faults.check(FaultPoint::BlobGet)?;
        let blobs = self.blobs.read().map_err(|_| StorageError::poisoned())?;
        Ok(blobs.get(&blob_key(container, name)).map(|b| b.data.clone()))
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError> {
        self.faults.check(FaultPoint::BlobPut)?;
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let current = blobs.get(&key);

        match (&precondition, current) {
            (WritePrecondition::DoesNotExist, Some(existing)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.version,
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(existing))
                if existing.version != *expected =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.version,
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed { current_version: 0 });
            }
            _ => {}
        }

        let version = current.map_or(1, |b| b.version + 1);
        let (metadata, lease, broken) = current
            .map(|b| (b.metadata.clone(), b.lease.clone(), b.broken))
            .unwrap_or_default();
        blobs.insert(
            key,
            StoredBlob {
                data,
                version,
                last_modified: Utc::now(),
                metadata,
                lease,
                broken,
            },
        );

        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, container: &str, name: &str) -> Result<bool, StorageError> {
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        Ok(blobs.remove(&blob_key(container, name)).is_some())
    }

    async fn head(
        &self,
        container: &str,
        name: &str,
    ) -> Result<Option<BlobProperties>, StorageError> {
        self.faults.check(FaultPoint::BlobHead)?;
        let blobs = self.blobs.read().map_err(|_| StorageError::poisoned())?;
        let now = Instant::now();
        Ok(blobs.get(&blob_key(container, name)).map(|b| BlobProperties {
            size: b.data.len() as u64,
            version: b.version,
            last_modified: b.last_modified,
            lease_state: b.lease_state(now),
            metadata: b.metadata.clone(),
        }))
    }

    async fn acquire_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
        period: Duration,
    ) -> Result<(), StorageError> {
        self.faults.check(FaultPoint::AcquireLease)?;
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let blob = blobs
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;

        let now = Instant::now();
        if let Some(active) = blob.active_lease(now) {
            if active.id != lease_id {
                return Err(StorageError::LeaseConflict(key));
            }
        }

        blob.lease = Some(Lease {
            id: lease_id.to_string(),
            period,
            expires_at: now + period,
        });
        blob.broken = false;
        Ok(())
    }

    async fn renew_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
    ) -> Result<(), StorageError> {
        self.faults.check(FaultPoint::RenewLease)?;
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let blob = blobs
            .get_mut(&key)
            .ok_or_else(|| StorageError::LeaseLost(key.clone()))?;

        let now = Instant::now();
        match blob.lease.as_mut() {
            Some(lease) if lease.id == lease_id && lease.expires_at > now => {
                lease.expires_at = now + lease.period;
                Ok(())
            }
            _ => Err(StorageError::LeaseLost(key)),
        }
    }

    async fn release_lease(
        &self,
        container: &str,
        name: &str,
        lease_id: &str,
    ) -> Result<(), StorageError> {
        self.faults.check(FaultPoint::ReleaseLease)?;
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let blob = blobs
            .get_mut(&key)
            .ok_or_else(|| StorageError::LeaseLost(key.clone()))?;

        match &blob.lease {
            Some(lease) if lease.id == lease_id => {
                blob.lease = None;
                Ok(())
            }
            _ => Err(StorageError::LeaseLost(key)),
        }
    }

    async fn break_lease(&self, container: &str, name: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let blob = blobs
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;
        if blob.lease.take().is_some() {
            blob.broken = true;
        }
        Ok(())
    }

    async fn set_metadata(
        &self,
        container: &str,
        name: &str,
        lease_id: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.faults.check(FaultPoint::SetMetadata)?;
        let mut blobs = self.blobs.write().map_err(|_| StorageError::poisoned())?;
        let key = blob_key(container, name);
        let blob = blobs
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(key.clone()))?;

        if let Some(active) = blob.active_lease(Instant::now()) {
            if lease_id != Some(active.id.as_str()) {
                return Err(StorageError::LeaseConflict(key));
            }
        }

        blob.metadata = metadata;
        blob.version += 1;
        blob.last_modified = Utc::now();
        Ok(())
    }
}

/// In-memory table store.
///
/// Continuation tokens are offsets into the ordered result set.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, BTreeMap<(String, String), TableEntity>>>,
    faults: Faults,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn fail_next(&self, point: FaultPoint, times: u32) {
        self.faults.arm(point, times);
    }

    /// Number of rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, StorageError> {
        self.faults.check(FaultPoint::TableGet)?;
        let tables = self.tables.read().map_err(|_| StorageError::poisoned())?;
        Ok(tables
            .get(table)
            .and_then(|rows| rows.get(&(partition_key.to_string(), row_key.to_string())))
            .cloned())
    }

    async fn upsert(&self, table: &str, entity: TableEntity) -> Result<(), StorageError> {
        self.upsert_if(table, entity, WritePrecondition::None).await?;
        Ok(())
    }

    async fn upsert_if(
        &self,
        table: &str,
        mut entity: TableEntity,
        precondition: WritePrecondition,
    ) -> Result<WriteResult, StorageError> {
        self.faults.check(FaultPoint::TableUpsert)?;
        let mut tables = self.tables.write().map_err(|_| StorageError::poisoned())?;
        let rows = tables.entry(table.to_string()).or_default();
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let current = rows.get(&key).and_then(|row| row.version);

        let holds = match (&precondition, current) {
            (WritePrecondition::None, _) => true,
            (WritePrecondition::DoesNotExist, current) => current.is_none(),
            (WritePrecondition::MatchesVersion(expected), Some(current)) => *expected == current,
            (WritePrecondition::MatchesVersion(_), None) => false,
        };
        if !holds {
            return Ok(WriteResult::PreconditionFailed {
                current_version: current.unwrap_or(0),
            });
        }

        let version = current.map_or(1, |v| v + 1);
        entity.timestamp = Some(Utc::now());
        entity.version = Some(version);
        rows.insert(key, entity);
        Ok(WriteResult::Success { version })
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().map_err(|_| StorageError::poisoned())?;
        Ok(tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&(partition_key.to_string(), row_key.to_string())))
            .is_some())
    }

    async fn query(&self, table: &str, query: &TableQuery) -> Result<TablePage, StorageError> {
        self.faults.check(FaultPoint::TableQuery)?;
        let tables = self.tables.read().map_err(|_| StorageError::poisoned())?;
        let Some(rows) = tables.get(table) else {
            return Ok(TablePage::default());
        };

        let mut matching: Vec<&TableEntity> = rows
            .values()
            .filter(|e| {
                query
                    .partition_key
                    .as_deref()
                    .is_none_or(|pk| e.partition_key == pk)
            })
            .filter(|e| query.filter.as_ref().is_none_or(|f| f.matches(e)))
            .collect();

        if let Some(order) = &query.order_by {
            // Stable sort keeps key order among equal (or missing) values.
            matching.sort_by(|a, b| {
                let ordering = match (a.get(&order.property), b.get(&order.property)) {
                    (Some(x), Some(y)) => compare(x, y).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let offset = match &query.continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StorageError::Other(format!("invalid continuation token: {token}")))?,
            None => 0,
        };
        let page_size = query.page_size.max(1);
        let end = (offset + page_size).min(matching.len());
        let entities = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| (*e).clone())
            .collect();
        let continuation = (end < matching.len()).then(|| end.to_string());

        Ok(TablePage {
            entities,
            continuation,
        })
    }
}
