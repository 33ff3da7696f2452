//! Table-backed authorization session and token stores.
//!
//! Rows are partitioned by adapter type and keyed by the identity's merged
//! organization/scope id. The record itself is kept as a JSON property so
//! adapter specific data survives unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use teamcloud_auth::{
    AuthStoreError, AuthorizationIdentity, AuthorizationSession, AuthorizationSessionStore,
    AuthorizationToken, AuthorizationTokenStore,
};

use crate::audit::sanitize_prefix;
use crate::storage::{StorageError, TableEntity, TableStore};

const RECORD_PROPERTY: &str = "Record";

impl From<StorageError> for AuthStoreError {
    fn from(value: StorageError) -> Self {
        AuthStoreError::Storage(value.to_string())
    }
}

#[derive(Clone)]
struct RecordTable {
    tables: Arc<dyn TableStore>,
    name: String,
}

impl RecordTable {
    async fn get<T: DeserializeOwned>(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<T>, AuthStoreError> {
        let row = self
            .tables
            .get(&self.name, identity.partition_key(), &identity.row_key().to_string())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json = row.get_str(RECORD_PROPERTY).ok_or_else(|| {
            AuthStoreError::Serialization(format!("row in {} has no {RECORD_PROPERTY}", self.name))
        })?;
        Ok(Some(serde_json::from_str(json)?))
    }

    async fn set<T: Serialize>(
        &self,
        identity: &AuthorizationIdentity,
        record: &T,
    ) -> Result<(), AuthStoreError> {
        let entity = TableEntity::new(identity.partition_key(), identity.row_key().to_string())
            .with(RECORD_PROPERTY, serde_json::to_string(record)?);
        self.tables.upsert(&self.name, entity).await?;
        Ok(())
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        Ok(self
            .tables
            .delete(&self.name, identity.partition_key(), &identity.row_key().to_string())
            .await?)
    }
}

impl std::fmt::Debug for RecordTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordTable").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Sessions in the `{prefix}AuthorizationSessions` table.
#[derive(Debug, Clone)]
pub struct TableSessionStore {
    table: RecordTable,
}

impl TableSessionStore {
    pub fn new(tables: Arc<dyn TableStore>, prefix: &str) -> Self {
        Self {
            table: RecordTable {
                tables,
                name: format!("{}AuthorizationSessions", sanitize_prefix(prefix)),
            },
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }
}

#[async_trait]
impl AuthorizationSessionStore for TableSessionStore {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationSession>, AuthStoreError> {
        let Some(session) = self.table.get::<AuthorizationSession>(identity).await? else {
            return Ok(None);
        };
        if session.is_active_at(Utc::now()) {
            return Ok(Some(session));
        }
        self.table.delete(identity).await?;
        debug!(adapter = %identity.adapter, "expired authorization session removed");
        Ok(None)
    }

    async fn set(&self, session: AuthorizationSession) -> Result<(), AuthStoreError> {
        self.table.set(&session.identity, &session).await
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        self.table.delete(identity).await
    }
}

/// Tokens in the `{prefix}AuthorizationTokens` table.
#[derive(Debug, Clone)]
pub struct TableTokenStore {
    table: RecordTable,
}

impl TableTokenStore {
    pub fn new(tables: Arc<dyn TableStore>, prefix: &str) -> Self {
        Self {
            table: RecordTable {
                tables,
                name: format!("{}AuthorizationTokens", sanitize_prefix(prefix)),
            },
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }
}

#[async_trait]
impl AuthorizationTokenStore for TableTokenStore {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationToken>, AuthStoreError> {
        self.table.get(identity).await
    }

    async fn set(&self, token: AuthorizationToken) -> Result<(), AuthStoreError> {
        self.table.set(&token.identity, &token).await
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        self.table.delete(identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use teamcloud_core::{DeploymentScopeId, OrganizationId};

    use crate::storage::memory::FaultPoint;
    use crate::storage::MemoryTableStore;

    fn identity() -> AuthorizationIdentity {
        AuthorizationIdentity::new("GitHubAdapter", OrganizationId::new(), DeploymentScopeId::new())
    }

    #[tokio::test]
    async fn session_is_stored_under_adapter_partition() {
        let tables = MemoryTableStore::arc();
        let store = TableSessionStore::new(tables.clone(), "tc-dev");
        let id = identity();
        let session = AuthorizationSession::new(id.clone())
            .with_data(serde_json::json!({ "verifier": "abc" }));

        store.set(session.clone()).await.unwrap();

        assert_eq!(store.table_name(), "tcdevAuthorizationSessions");
        let row = tables
            .get(store.table_name(), "GitHubAdapter", &id.row_key().to_string())
            .await
            .unwrap();
        assert!(row.is_some());
        assert_eq!(store.get(&id).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn expired_session_is_deleted_on_read() {
        let tables = MemoryTableStore::arc();
        let store = TableSessionStore::new(tables.clone(), "tc");
        let id = identity();
        let mut stale = AuthorizationSession::new(id.clone());
        stale.timestamp = Utc::now() - Duration::minutes(6);
        store.set(stale).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), None);
        assert_eq!(tables.len(store.table_name()), 0);
    }

    #[tokio::test]
    async fn tokens_survive_until_deleted() {
        let store = TableTokenStore::new(MemoryTableStore::arc(), "tc");
        let id = identity();
        let token = AuthorizationToken::new(id.clone(), serde_json::json!({ "pat": "x" }));

        store.set(token.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(token));
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn storage_failures_surface_as_store_errors() {
        let tables = MemoryTableStore::arc();
        let store = TableTokenStore::new(tables.clone(), "tc");
        tables.fail_next(FaultPoint::TableGet, 1);

        let err = store.get(&identity()).await.unwrap_err();
        assert!(matches!(err, AuthStoreError::Storage(_)));
    }
}
