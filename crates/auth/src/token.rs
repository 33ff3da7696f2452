use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identity::AuthorizationIdentity;

/// A durable credential obtained from an authorization handshake.
///
/// Expiry is adapter defined; `expires` is `None` for credentials that do not
/// expire on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationToken {
    pub identity: AuthorizationIdentity,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: JsonValue,
}

impl AuthorizationToken {
    pub fn new(identity: AuthorizationIdentity, data: JsonValue) -> Self {
        Self {
            identity,
            timestamp: Utc::now(),
            expires: None,
            data,
        }
    }

    pub fn expiring_at(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }
}
