//! Command errors and validation failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a [`CommandError`]. Only `Error` fails a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    #[default]
    Error,
}

impl core::fmt::Display for Severity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Severity::Warning => f.write_str("Warning"),
            Severity::Error => f.write_str("Error"),
        }
    }
}

/// A severity-tagged message attached to a command result.
///
/// This is the serialisable form every failure is reduced to before it is
/// recorded, so results survive journaling and replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
}

impl CommandError {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    /// Capture an arbitrary error (and its source chain) as an `Error` entry.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        Self::error(message)
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl core::fmt::Display for CommandError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

/// Structural or semantic problems found before a command is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandValidationError {
    #[error("missing identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("scope mismatch: {0}")]
    ScopeMismatch(String),

    #[error("{action} is not supported for {payload} payloads")]
    NotSupported {
        action: String,
        payload: &'static str,
    },
}
