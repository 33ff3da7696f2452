//! Command result: the engine-owned, mutable view of a command's execution.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use teamcloud_core::{CommandId, OrganizationId};

use crate::command::Command;
use crate::error::CommandError;
use crate::status::RuntimeStatus;

/// Name of the link pointing at the status endpoint of a command.
pub const STATUS_LINK: &str = "status";

/// Result of a command, one-to-one with a [`Command`].
///
/// Two invariants are enforced here rather than by callers:
///
/// - once the status is final it never changes again;
/// - any `Error`-severity entry makes the status read as `Failed`, whatever
///   raw status was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: CommandId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    runtime_status: RuntimeStatus,
    #[serde(default)]
    pub custom_status: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    errors: Vec<CommandError>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub links: BTreeMap<String, String>,
    /// How long an asynchronous provider expects to need, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CommandResult {
    pub fn new(command: &Command) -> Self {
        Self::for_command(command.command_id, command.organization_id)
    }

    pub fn for_command(command_id: CommandId, organization_id: OrganizationId) -> Self {
        let now = Utc::now();
        Self {
            command_id,
            organization_id,
            runtime_status: RuntimeStatus::Unknown,
            custom_status: None,
            created_time: Some(now),
            last_updated_time: Some(now),
            errors: Vec::new(),
            result: None,
            links: BTreeMap::new(),
            timeout_secs: None,
        }
    }

    /// Effective status (forced to `Failed` when an error is present).
    pub fn runtime_status(&self) -> RuntimeStatus {
        if self.errors.iter().any(CommandError::is_error) {
            RuntimeStatus::Failed
        } else {
            self.runtime_status
        }
    }

    /// The stored status, ignoring recorded errors.
    pub fn raw_runtime_status(&self) -> RuntimeStatus {
        self.runtime_status
    }

    pub fn is_final(&self) -> bool {
        self.runtime_status().is_final()
    }

    pub fn is_active(&self) -> bool {
        self.runtime_status().is_active()
    }

    /// Transition to `status`. Returns false (and changes nothing) when the
    /// result is already final.
    pub fn set_runtime_status(&mut self, status: RuntimeStatus) -> bool {
        if self.is_final() {
            return false;
        }
        self.runtime_status = status;
        self.touch();
        true
    }

    pub fn set_custom_status(&mut self, status: impl Into<String>) {
        self.custom_status = Some(status.into());
        self.touch();
    }

    pub fn errors(&self) -> &[CommandError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(CommandError::is_error)
    }

    pub fn add_error(&mut self, error: CommandError) {
        self.errors.push(error);
        self.touch();
    }

    pub fn add_errors(&mut self, errors: impl IntoIterator<Item = CommandError>) {
        self.errors.extend(errors);
        self.touch();
    }

    /// Errors rendered one per line as `[Severity] message`.
    pub fn errors_text(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn set_result(&mut self, result: JsonValue) {
        self.result = Some(result);
        self.touch();
    }

    pub fn with_link(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.links.insert(name.into(), url.into());
        self
    }

    pub fn status_link(&self) -> Option<&str> {
        self.links.get(STATUS_LINK).map(String::as_str)
    }

    /// Provider-reported timeout, if any.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_secs.map(std::time::Duration::from_secs)
    }

    /// Adopt the state reported by an external provider for the same command.
    ///
    /// A final local result is kept as is. Errors are appended, links and the
    /// created time of the local result are preserved.
    pub fn absorb(&mut self, reported: CommandResult) -> bool {
        if self.is_final() {
            return false;
        }
        self.runtime_status = reported.runtime_status;
        if reported.custom_status.is_some() {
            self.custom_status = reported.custom_status;
        }
        if reported.result.is_some() {
            self.result = reported.result;
        }
        if reported.timeout_secs.is_some() {
            self.timeout_secs = reported.timeout_secs;
        }
        self.errors.extend(reported.errors);
        for (name, url) in reported.links {
            self.links.entry(name).or_insert(url);
        }
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.last_updated_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> CommandResult {
        CommandResult::for_command(CommandId::new(), OrganizationId::new())
    }

    #[test]
    fn error_forces_failed_regardless_of_raw_status() {
        let mut r = result();
        r.set_runtime_status(RuntimeStatus::Running);
        r.add_error(CommandError::error("boom"));

        assert_eq!(r.raw_runtime_status(), RuntimeStatus::Running);
        assert_eq!(r.runtime_status(), RuntimeStatus::Failed);
        assert!(r.is_final());
    }

    #[test]
    fn warnings_do_not_fail_the_command() {
        let mut r = result();
        r.set_runtime_status(RuntimeStatus::Completed);
        r.add_error(CommandError::warning("slow provider"));

        assert_eq!(r.runtime_status(), RuntimeStatus::Completed);
        assert!(!r.has_errors());
    }

    #[test]
    fn final_status_never_changes() {
        let mut r = result();
        assert!(r.set_runtime_status(RuntimeStatus::Completed));
        assert!(!r.set_runtime_status(RuntimeStatus::Running));
        assert_eq!(r.runtime_status(), RuntimeStatus::Completed);

        let mut reported = result();
        reported.set_runtime_status(RuntimeStatus::Failed);
        assert!(!r.absorb(reported));
        assert_eq!(r.runtime_status(), RuntimeStatus::Completed);
    }

    #[test]
    fn errors_text_joins_lines() {
        let mut r = result();
        r.add_errors([CommandError::warning("a"), CommandError::error("b")]);
        assert_eq!(r.errors_text(), "[Warning] a\n[Error] b");
    }

    #[test]
    fn absorb_keeps_local_links() {
        let mut local = result().with_link(STATUS_LINK, "http://local/status");
        let mut reported = result().with_link(STATUS_LINK, "http://provider/status");
        reported.set_runtime_status(RuntimeStatus::Completed);
        reported.set_result(serde_json::json!({"ok": true}));

        assert!(local.absorb(reported));
        assert_eq!(local.status_link(), Some("http://local/status"));
        assert_eq!(local.runtime_status(), RuntimeStatus::Completed);
        assert_eq!(local.result, Some(serde_json::json!({"ok": true})));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn status() -> impl Strategy<Value = RuntimeStatus> {
            prop::sample::select(RuntimeStatus::ALL.to_vec())
        }

        proptest! {
            /// Property: after reaching a final status, no sequence of
            /// transitions changes the effective status.
            #[test]
            fn final_status_is_sticky(
                first in status(),
                rest in prop::collection::vec(status(), 0..16),
            ) {
                let mut r = result();
                r.set_runtime_status(first);
                let mut settled = if first.is_final() { Some(first) } else { None };

                for next in rest {
                    r.set_runtime_status(next);
                    match settled {
                        Some(s) => prop_assert_eq!(r.runtime_status(), s),
                        None if next.is_final() => settled = Some(next),
                        None => {}
                    }
                }
            }
        }
    }
}
