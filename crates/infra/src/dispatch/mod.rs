//! Command dispatch to remote providers.
//!
//! A provider is an HTTP endpoint that accepts [`CommandMessage`]s. The
//! response decides what happens next:
//!
//! ```text
//! 2xx  -> result (a 202 without body means "accepted, still running")
//! 400  -> rejected, not retried
//! 401  -> rejected, not retried
//! 409  -> already in flight, GET {url}/{commandId} for the current result
//! else -> retried with backoff, then surfaced as an error
//! ```
//!
//! [`CommandMessage`]: teamcloud_commands::CommandMessage

pub mod sender;
pub mod transport;

pub use sender::CommandSender;
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use teamcloud_core::CommandId;

/// Header carrying the provider's auth code.
pub const AUTH_CODE_HEADER: &str = "x-functions-key";

/// Header carrying the url an asynchronous provider posts its result to.
pub const CALLBACK_HEADER: &str = "x-functions-callback";

const COMMAND_PATH: &str = "api/command";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The provider refused the payload; sending it again cannot succeed.
    #[error("provider '{provider}' rejected the command ({status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("provider '{provider}' responded with {status}: {message}")]
    Status {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    Decode(String),

    #[error("provider '{provider}' ran into timeout ({}s)", .after.as_secs())]
    Timeout { provider: String, after: Duration },
}

impl DispatchError {
    /// Whether another attempt with the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Status { .. } | DispatchError::Transport(_))
    }
}

/// A remote provider that commands can be pushed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEndpoint {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub auth_code: Option<String>,
    /// Upper bound for waiting on an asynchronous result.
    #[serde(default, with = "opt_secs")]
    pub timeout: Option<Duration>,
}

impl ProviderEndpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            auth_code: None,
            timeout: None,
        }
    }

    pub fn with_auth_code(mut self, code: impl Into<String>) -> Self {
        self.auth_code = Some(code.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Url commands are posted to.
    ///
    /// A url whose path already ends with `/` is used as is, anything else
    /// gets `api/command` appended.
    pub fn command_url(&self) -> String {
        let url = self.url.trim();
        if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{url}/{COMMAND_PATH}")
        }
    }

    /// Url of a single command's status.
    pub fn status_url(&self, command_id: CommandId) -> String {
        format!("{}/{command_id}", self.command_url().trim_end_matches('/'))
    }

    /// How long to wait for a callback, given what the provider reported.
    ///
    /// A reported timeout is honoured only when it is positive and below
    /// `max`; otherwise the provider's configured timeout, then `max`, apply.
    pub fn callback_timeout(&self, reported: Option<Duration>, max: Duration) -> Duration {
        reported
            .or(self.timeout)
            .filter(|t| !t.is_zero() && *t < max)
            .unwrap_or(max)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_url_appends_segment_unless_path_qualified() {
        assert_eq!(
            ProviderEndpoint::new("p", " https://provider.example ").command_url(),
            "https://provider.example/api/command"
        );
        assert_eq!(
            ProviderEndpoint::new("p", "https://provider.example/hooks").command_url(),
            "https://provider.example/hooks/api/command"
        );
        assert_eq!(
            ProviderEndpoint::new("p", "https://provider.example/custom/").command_url(),
            "https://provider.example/custom/"
        );
    }

    #[test]
    fn status_url_appends_command_id() {
        let id = CommandId::new();
        assert_eq!(
            ProviderEndpoint::new("p", "http://h").status_url(id),
            format!("http://h/api/command/{id}")
        );
        assert_eq!(
            ProviderEndpoint::new("p", "http://h/x/").status_url(id),
            format!("http://h/x/{id}")
        );
    }

    #[test]
    fn callback_timeout_prefers_reported_value_within_bounds() {
        let max = Duration::from_secs(1800);
        let provider = ProviderEndpoint::new("p", "http://h");

        assert_eq!(provider.callback_timeout(Some(Duration::from_secs(60)), max), Duration::from_secs(60));
        assert_eq!(provider.callback_timeout(Some(Duration::ZERO), max), max);
        assert_eq!(provider.callback_timeout(Some(Duration::from_secs(7200)), max), max);
        assert_eq!(provider.callback_timeout(None, max), max);

        let bounded = provider.with_timeout(Duration::from_secs(90));
        assert_eq!(bounded.callback_timeout(None, max), Duration::from_secs(90));
    }

    #[test]
    fn only_status_and_transport_errors_are_retryable() {
        let status = DispatchError::Status {
            provider: "p".into(),
            status: 503,
            message: String::new(),
        };
        let rejected = DispatchError::Rejected {
            provider: "p".into(),
            status: 400,
            message: String::new(),
        };
        assert!(status.is_retryable());
        assert!(DispatchError::Transport("reset".into()).is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!DispatchError::Decode("eof".into()).is_retryable());
    }
}
