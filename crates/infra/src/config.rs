//! Engine configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Upper bound for any single command.
pub const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// A command still running after this long is failed with a timeout error.
    pub max_command_timeout: Duration,
    /// Polling interval of monitoring sub-orchestrations.
    pub monitor_interval: Duration,
    /// How often a queued command re-checks the active command of its project.
    pub serialization_poll_interval: Duration,
    pub dispatch_retry: RetryPolicy,
    /// Public base url; callback and status links are built from it.
    pub callback_base_url: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_command_timeout: MAX_COMMAND_TIMEOUT,
            monitor_interval: Duration::from_secs(10),
            serialization_poll_interval: Duration::from_secs(2),
            dispatch_retry: RetryPolicy::default(),
            callback_base_url: None,
        }
    }
}

impl EngineOptions {
    pub fn with_max_command_timeout(mut self, timeout: Duration) -> Self {
        self.max_command_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_serialization_poll_interval(mut self, interval: Duration) -> Self {
        self.serialization_poll_interval = interval;
        self
    }

    pub fn with_dispatch_retry(mut self, retry: RetryPolicy) -> Self {
        self.dispatch_retry = retry;
        self
    }

    pub fn with_callback_base_url(mut self, url: impl Into<String>) -> Self {
        self.callback_base_url = Some(url.into());
        self
    }

    fn base_url(&self) -> Option<&str> {
        self.callback_base_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty())
    }

    /// Where a provider posts the result of `command_id`.
    pub fn callback_url(&self, command_id: impl std::fmt::Display) -> Option<String> {
        self.base_url()
            .map(|base| format!("{base}/callbacks/{command_id}"))
    }

    /// Status endpoint of a command.
    pub fn status_url(
        &self,
        organization_id: impl std::fmt::Display,
        command_id: impl std::fmt::Display,
    ) -> Option<String> {
        self.base_url()
            .map(|base| format!("{base}/orgs/{organization_id}/commands/{command_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.max_command_timeout, Duration::from_secs(1800));
        assert_eq!(options.monitor_interval, Duration::from_secs(10));
        assert_eq!(options.dispatch_retry.max_attempts, 5);
        assert_eq!(options.callback_url("c"), None);
    }

    #[test]
    fn urls_are_built_from_trimmed_base() {
        let options = EngineOptions::default().with_callback_base_url(" https://tc.example/ ");
        assert_eq!(
            options.callback_url("c1").as_deref(),
            Some("https://tc.example/callbacks/c1")
        );
        assert_eq!(
            options.status_url("o1", "c1").as_deref(),
            Some("https://tc.example/orgs/o1/commands/c1")
        );
    }
}
