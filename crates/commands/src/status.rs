//! Runtime status of a command execution.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a command's execution.
///
/// ```text
/// Unknown → Pending → Running → { Completed | Failed | Canceled | Terminated }
/// ```
///
/// `ContinuedAsNew` is an internal continuation and still counts as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuntimeStatus {
    #[default]
    Unknown,
    Pending,
    Running,
    ContinuedAsNew,
    Completed,
    Failed,
    Canceled,
    Terminated,
}

impl RuntimeStatus {
    pub const ALL: [RuntimeStatus; 8] = [
        RuntimeStatus::Unknown,
        RuntimeStatus::Pending,
        RuntimeStatus::Running,
        RuntimeStatus::ContinuedAsNew,
        RuntimeStatus::Completed,
        RuntimeStatus::Failed,
        RuntimeStatus::Canceled,
        RuntimeStatus::Terminated,
    ];

    /// Pending, Running or ContinuedAsNew.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Pending | RuntimeStatus::Running | RuntimeStatus::ContinuedAsNew
        )
    }

    /// Completed, Failed, Canceled or Terminated. A final status never changes.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed
                | RuntimeStatus::Failed
                | RuntimeStatus::Canceled
                | RuntimeStatus::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeStatus::Unknown => "Unknown",
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::ContinuedAsNew => "ContinuedAsNew",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Canceled => "Canceled",
            RuntimeStatus::Terminated => "Terminated",
        }
    }
}

impl core::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown runtime status: {s}"))
    }
}
