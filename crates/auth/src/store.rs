//! Session and token persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::AuthStoreError;
use crate::identity::AuthorizationIdentity;
use crate::session::AuthorizationSession;
use crate::token::AuthorizationToken;

/// Store for in-flight authorization sessions.
///
/// `get` never returns an expired session: expired sessions are deleted on
/// read and reported as absent.
#[async_trait]
pub trait AuthorizationSessionStore: Send + Sync {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationSession>, AuthStoreError>;

    async fn set(&self, session: AuthorizationSession) -> Result<(), AuthStoreError>;

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError>;
}

/// Store for durable provider tokens.
#[async_trait]
pub trait AuthorizationTokenStore: Send + Sync {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationToken>, AuthStoreError>;

    async fn set(&self, token: AuthorizationToken) -> Result<(), AuthStoreError>;

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError>;
}

#[async_trait]
impl<S: AuthorizationSessionStore + ?Sized> AuthorizationSessionStore for Arc<S> {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationSession>, AuthStoreError> {
        (**self).get(identity).await
    }

    async fn set(&self, session: AuthorizationSession) -> Result<(), AuthStoreError> {
        (**self).set(session).await
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        (**self).delete(identity).await
    }
}

#[async_trait]
impl<S: AuthorizationTokenStore + ?Sized> AuthorizationTokenStore for Arc<S> {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationToken>, AuthStoreError> {
        (**self).get(identity).await
    }

    async fn set(&self, token: AuthorizationToken) -> Result<(), AuthStoreError> {
        (**self).set(token).await
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        (**self).delete(identity).await
    }
}

type Key = (String, Uuid);

fn key(identity: &AuthorizationIdentity) -> Key {
    (identity.partition_key().to_string(), identity.row_key())
}

fn poisoned() -> AuthStoreError {
    AuthStoreError::Storage("lock poisoned".to_string())
}

/// In-memory session store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Key, AuthorizationSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl AuthorizationSessionStore for InMemorySessionStore {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationSession>, AuthStoreError> {
        let key = key(identity);
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        match sessions.get(&key) {
            Some(session) if session.is_active_at(Utc::now()) => Ok(Some(session.clone())),
            Some(_) => {
                sessions.remove(&key);
                tracing::debug!(adapter = %identity.adapter, "expired authorization session removed");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, session: AuthorizationSession) -> Result<(), AuthStoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        sessions.insert(key(&session.identity), session);
        Ok(())
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        Ok(sessions.remove(&key(identity)).is_some())
    }
}

/// In-memory token store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<Key, AuthorizationToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl AuthorizationTokenStore for InMemoryTokenStore {
    async fn get(
        &self,
        identity: &AuthorizationIdentity,
    ) -> Result<Option<AuthorizationToken>, AuthStoreError> {
        let tokens = self.tokens.read().map_err(|_| poisoned())?;
        Ok(tokens.get(&key(identity)).cloned())
    }

    async fn set(&self, token: AuthorizationToken) -> Result<(), AuthStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        tokens.insert(key(&token.identity), token);
        Ok(())
    }

    async fn delete(&self, identity: &AuthorizationIdentity) -> Result<bool, AuthStoreError> {
        let mut tokens = self.tokens.write().map_err(|_| poisoned())?;
        Ok(tokens.remove(&key(identity)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use teamcloud_core::{DeploymentScopeId, OrganizationId};

    fn identity(adapter: &str) -> AuthorizationIdentity {
        AuthorizationIdentity::new(adapter, OrganizationId::new(), DeploymentScopeId::new())
    }

    #[tokio::test]
    async fn expired_sessions_are_deleted_not_reused() {
        let store = InMemorySessionStore::new();
        let id = identity("GitHubAdapter");

        let mut stale = AuthorizationSession::new(id.clone());
        stale.timestamp = Utc::now() - Duration::minutes(10);
        store.set(stale).await.unwrap();

        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap(), "expired session should already be gone");
    }

    #[tokio::test]
    async fn active_session_is_returned() {
        let store = InMemorySessionStore::arc();
        let id = identity("GitHubAdapter");
        let session = AuthorizationSession::new(id.clone());
        store.set(session.clone()).await.unwrap();

        assert_eq!(store.get(&id).await.unwrap(), Some(session));
    }

    #[tokio::test]
    async fn identities_are_unique_per_adapter_type() {
        let store = InMemoryTokenStore::new();
        let github = identity("GitHubAdapter");
        let k8s = AuthorizationIdentity::new(
            "KubernetesAdapter",
            github.organization,
            github.deployment_scope,
        );

        store
            .set(AuthorizationToken::new(github.clone(), serde_json::json!({"token": "gh"})))
            .await
            .unwrap();

        assert!(store.get(&github).await.unwrap().is_some());
        assert!(store.get(&k8s).await.unwrap().is_none());
    }
}
