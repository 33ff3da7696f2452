//! Environment configuration of the API process.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use teamcloud_infra::config::MAX_COMMAND_TIMEOUT;
use teamcloud_infra::dispatch::ProviderEndpoint;
use teamcloud_observability::LogFormat;

pub const BIND_ADDR_ENV: &str = "TEAMCLOUD_BIND_ADDR";
pub const PUBLIC_URL_ENV: &str = "TEAMCLOUD_PUBLIC_URL";
pub const STORAGE_PREFIX_ENV: &str = "TEAMCLOUD_STORAGE_PREFIX";
pub const MAX_COMMAND_TIMEOUT_ENV: &str = "TEAMCLOUD_MAX_COMMAND_TIMEOUT_SECS";
pub const SYNC_WAIT_ENV: &str = "TEAMCLOUD_SYNC_WAIT_MS";
pub const PROVIDERS_ENV: &str = "TEAMCLOUD_PROVIDERS";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STORAGE_PREFIX: &str = "teamcloud";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// A provider routed by command name pattern (`ProjectCreateCommand`,
/// `Project*` or `*`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderRoute {
    pub pattern: String,
    #[serde(flatten)]
    pub provider: ProviderEndpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Base url callbacks and status links are built from.
    pub public_url: String,
    pub storage_prefix: String,
    pub max_command_timeout: Duration,
    /// How long `POST /commands` waits for a final result before answering
    /// `202 Accepted`.
    pub sync_wait: Duration,
    pub log_format: LogFormat,
    pub providers: Vec<ProviderRoute>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_url: "http://localhost:8080".to_string(),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            max_command_timeout: MAX_COMMAND_TIMEOUT,
            sync_wait: Duration::ZERO,
            log_format: LogFormat::Json,
            providers: Vec::new(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = value(BIND_ADDR_ENV)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| invalid(BIND_ADDR_ENV, e))?;

        let public_url = match value(PUBLIC_URL_ENV) {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let url = format!("http://localhost:{}", bind_addr.port());
                warn!(public_url = %url, "{PUBLIC_URL_ENV} not set; callbacks only reach this host");
                url
            }
        };

        let max_command_timeout = match value(MAX_COMMAND_TIMEOUT_ENV) {
            Some(secs) => {
                let secs = secs
                    .parse::<u64>()
                    .map_err(|e| invalid(MAX_COMMAND_TIMEOUT_ENV, e))?;
                if secs == 0 {
                    return Err(invalid(MAX_COMMAND_TIMEOUT_ENV, "must be positive"));
                }
                Duration::from_secs(secs)
            }
            None => MAX_COMMAND_TIMEOUT,
        };

        let sync_wait = match value(SYNC_WAIT_ENV) {
            Some(ms) => Duration::from_millis(ms.parse().map_err(|e| invalid(SYNC_WAIT_ENV, e))?),
            None => Duration::ZERO,
        };

        let log_format = match value(teamcloud_observability::LOG_FORMAT_ENV) {
            Some(format) => format
                .parse()
                .map_err(|e| invalid(teamcloud_observability::LOG_FORMAT_ENV, e))?,
            None => LogFormat::Json,
        };

        let providers = match value(PROVIDERS_ENV) {
            Some(json) => serde_json::from_str(&json).map_err(|e| invalid(PROVIDERS_ENV, e))?,
            None => Vec::new(),
        };

        Ok(Self {
            bind_addr,
            public_url,
            storage_prefix: value(STORAGE_PREFIX_ENV).unwrap_or_else(|| DEFAULT_STORAGE_PREFIX.to_string()),
            max_command_timeout,
            sync_wait,
            log_format,
            providers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.public_url, "http://localhost:8080");
        assert_eq!(config.storage_prefix, "teamcloud");
        assert_eq!(config.max_command_timeout, Duration::from_secs(1800));
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn reads_every_variable() {
        let config = ApiConfig::from_lookup(lookup(&[
            (BIND_ADDR_ENV, "127.0.0.1:9000"),
            (PUBLIC_URL_ENV, "https://tc.example/ "),
            (STORAGE_PREFIX_ENV, "tcdev"),
            (MAX_COMMAND_TIMEOUT_ENV, "120"),
            (SYNC_WAIT_ENV, "250"),
            ("TEAMCLOUD_LOG_FORMAT", "pretty"),
            (
                PROVIDERS_ENV,
                r#"[{"pattern":"Project*","id":"arm","url":"https://arm.example","authCode":"k","timeout":60}]"#,
            ),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.public_url, "https://tc.example");
        assert_eq!(config.storage_prefix, "tcdev");
        assert_eq!(config.max_command_timeout, Duration::from_secs(120));
        assert_eq!(config.sync_wait, Duration::from_millis(250));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].pattern, "Project*");
        assert_eq!(config.providers[0].provider.auth_code.as_deref(), Some("k"));
        assert_eq!(config.providers[0].provider.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            ApiConfig::from_lookup(lookup(&[(MAX_COMMAND_TIMEOUT_ENV, "0")])),
            Err(ConfigError::Invalid { name: MAX_COMMAND_TIMEOUT_ENV, .. })
        ));
        assert!(matches!(
            ApiConfig::from_lookup(lookup(&[(BIND_ADDR_ENV, "nowhere")])),
            Err(ConfigError::Invalid { name: BIND_ADDR_ENV, .. })
        ));
    }
}
