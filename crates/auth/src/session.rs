use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::identity::AuthorizationIdentity;

/// Lifetime of an authorization session unless the adapter overrides it.
pub const DEFAULT_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// An in-flight interactive authorization handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationSession {
    pub identity: AuthorizationIdentity,
    /// Opaque value round-tripped through the external provider.
    pub state: String,
    pub timestamp: DateTime<Utc>,
    pub ttl_seconds: i64,
    /// Adapter specific handshake data (code verifier, redirect, ...).
    #[serde(default)]
    pub data: JsonValue,
}

impl AuthorizationSession {
    pub fn new(identity: AuthorizationIdentity) -> Self {
        Self {
            identity,
            state: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            ttl_seconds: DEFAULT_SESSION_TTL.as_secs() as i64,
            data: JsonValue::Null,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_seconds = ttl.num_seconds();
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::seconds(self.ttl_seconds)
    }

    /// True while `timestamp + ttl` lies in the future.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamcloud_core::{DeploymentScopeId, OrganizationId};

    #[test]
    fn session_expires_after_ttl() {
        let identity =
            AuthorizationIdentity::new("GitHubAdapter", OrganizationId::new(), DeploymentScopeId::new());
        let session = AuthorizationSession::new(identity);

        assert!(session.is_active_at(session.timestamp));
        assert!(session.is_active_at(session.timestamp + Duration::minutes(4)));
        assert!(!session.is_active_at(session.timestamp + Duration::minutes(5)));
    }
}
