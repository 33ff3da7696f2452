//! Interactive authorization of a deployment scope.
//!
//! The handshake is: [`Authorizable::create_session`] stores a short-lived
//! session and hands its `state` to the external provider; the provider calls
//! back with that state, [`Authorizable::handle_callback`] checks it against
//! the active session, deletes the session and persists the resulting token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use teamcloud_auth::{
    AuthorizationIdentity, AuthorizationSession, AuthorizationSessionStore, AuthorizationToken,
    AuthorizationTokenStore, DEFAULT_SESSION_TTL,
};
use teamcloud_core::DeploymentScope;

use crate::error::AdapterError;

/// Session and token bookkeeping shared by authorizable adapters.
#[derive(Clone)]
pub struct AuthorizationFlow {
    adapter: String,
    sessions: Arc<dyn AuthorizationSessionStore>,
    tokens: Arc<dyn AuthorizationTokenStore>,
    session_ttl: Duration,
}

impl std::fmt::Debug for AuthorizationFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationFlow")
            .field("adapter", &self.adapter)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl AuthorizationFlow {
    /// `adapter` is the adapter's type name and partitions its identities.
    pub fn new(
        adapter: impl Into<String>,
        sessions: Arc<dyn AuthorizationSessionStore>,
        tokens: Arc<dyn AuthorizationTokenStore>,
    ) -> Self {
        Self {
            adapter: adapter.into(),
            sessions,
            tokens,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn identity(&self, scope: &DeploymentScope) -> AuthorizationIdentity {
        AuthorizationIdentity::new(self.adapter.clone(), scope.organization, scope.id)
    }

    pub async fn create_session(
        &self,
        scope: &DeploymentScope,
        data: JsonValue,
    ) -> Result<AuthorizationSession, AdapterError> {
        let ttl = chrono::Duration::from_std(self.session_ttl)
            .map_err(|e| AdapterError::provider(format!("invalid session ttl: {e}")))?;
        let session = AuthorizationSession::new(self.identity(scope))
            .with_ttl(ttl)
            .with_data(data);
        self.sessions.set(session.clone()).await?;
        info!(adapter = %self.adapter, deployment_scope = %scope.id, "authorization session created");
        Ok(session)
    }

    /// Consume the active session of `scope` if `state` matches it.
    pub async fn take_session(
        &self,
        scope: &DeploymentScope,
        state: &str,
    ) -> Result<AuthorizationSession, AdapterError> {
        let identity = self.identity(scope);
        let session = self
            .sessions
            .get(&identity)
            .await?
            .ok_or(AdapterError::SessionNotFound)?;
        if session.state != state {
            warn!(adapter = %self.adapter, deployment_scope = %scope.id, "authorization state mismatch");
            return Err(AdapterError::StateMismatch);
        }
        self.sessions.delete(&identity).await?;
        Ok(session)
    }

    pub async fn store_token(&self, token: AuthorizationToken) -> Result<(), AdapterError> {
        self.tokens.set(token).await?;
        Ok(())
    }

    pub async fn token(
        &self,
        scope: &DeploymentScope,
    ) -> Result<Option<AuthorizationToken>, AdapterError> {
        Ok(self.tokens.get(&self.identity(scope)).await?)
    }

    /// Whether an unexpired token exists for `scope`.
    pub async fn is_authorized(&self, scope: &DeploymentScope) -> Result<bool, AdapterError> {
        Ok(self
            .token(scope)
            .await?
            .is_some_and(|t| !t.is_expired_at(Utc::now())))
    }
}

/// Capability of adapters that need an interactive authorization.
#[async_trait]
pub trait Authorizable: Send + Sync {
    fn authorization(&self) -> &AuthorizationFlow;

    /// Turn the provider's callback payload into a credential.
    async fn exchange(
        &self,
        scope: &DeploymentScope,
        session: &AuthorizationSession,
        payload: JsonValue,
    ) -> Result<AuthorizationToken, AdapterError>;

    /// Data stored with a new session, e.g. a redirect url.
    fn session_data(&self, _scope: &DeploymentScope) -> JsonValue {
        JsonValue::Null
    }

    async fn create_session(
        &self,
        scope: &DeploymentScope,
    ) -> Result<AuthorizationSession, AdapterError> {
        self.authorization()
            .create_session(scope, self.session_data(scope))
            .await
    }

    async fn handle_callback(
        &self,
        scope: &DeploymentScope,
        state: &str,
        payload: JsonValue,
    ) -> Result<AuthorizationToken, AdapterError> {
        let flow = self.authorization();
        let session = flow.take_session(scope, state).await?;
        let token = self.exchange(scope, &session, payload).await?;
        flow.store_token(token.clone()).await?;
        info!(adapter = %flow.adapter(), deployment_scope = %scope.id, "deployment scope authorized");
        Ok(token)
    }
}
