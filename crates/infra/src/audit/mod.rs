//! Command audit trail.
//!
//! Every command leaves two traces: JSON dumps of the command and its latest
//! result in a blob container, and one merged row per command in an audit
//! table that can be listed and filtered.

pub mod entity;
pub mod reader;
pub mod writer;

pub use entity::CommandAuditEntity;
pub use reader::{AuditQuery, CommandAuditReader};
pub use writer::CommandAuditWriter;

use thiserror::Error;

use crate::storage::StorageError;

/// Longest storage prefix kept after sanitising.
pub const MAX_PREFIX_LEN: usize = 45;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("audit serialization error: {0}")]
    Serialization(String),

    /// The record kept changing underneath every conditional write.
    #[error("audit record {0} is contended")]
    Contended(String),

    /// At least one of the two independent writes failed.
    #[error("audit write incomplete (blob: {blob}, table: {table})")]
    Incomplete { blob: String, table: String },
}

impl From<serde_json::Error> for AuditError {
    fn from(value: serde_json::Error) -> Self {
        AuditError::Serialization(value.to_string())
    }
}

/// Naming and paging of the audit storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOptions {
    prefix: String,
    pub page_size: usize,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self::new("teamcloud")
    }
}

impl AuditOptions {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: sanitize_prefix(prefix),
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Blob container holding the JSON dumps, e.g. `teamcloud-audit`.
    pub fn container_name(&self) -> String {
        format!("{}-audit", self.prefix)
            .trim()
            .trim_start_matches('-')
            .to_lowercase()
    }

    /// Table holding the audit rows, e.g. `teamcloudAudit`.
    pub fn table_name(&self) -> String {
        format!("{}Audit", self.prefix)
    }
}

/// Reduce a storage prefix to characters every backend accepts.
///
/// Only letters and digits survive; a leading digit gets an `a` in front and
/// the result is cut to [`MAX_PREFIX_LEN`] characters.
pub fn sanitize_prefix(raw: &str) -> String {
    let kept: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
    let Some(first) = kept.chars().next() else {
        return String::new();
    };
    let prefixed = if first.is_numeric() {
        format!("a{kept}")
    } else {
        kept
    };
    prefixed.chars().take(MAX_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        let options = AuditOptions::default();
        assert_eq!(options.container_name(), "teamcloud-audit");
        assert_eq!(options.table_name(), "teamcloudAudit");
    }

    #[test]
    fn prefix_is_sanitised() {
        assert_eq!(sanitize_prefix("Team-Cloud_dev"), "TeamClouddev");
        assert_eq!(sanitize_prefix("42tc"), "a42tc");
        assert_eq!(sanitize_prefix("--"), "");
        assert_eq!(sanitize_prefix(&"x".repeat(80)).len(), MAX_PREFIX_LEN);
    }

    #[test]
    fn container_name_is_lowercase_and_never_starts_with_dash() {
        assert_eq!(AuditOptions::new("TeamCloud").container_name(), "teamcloud-audit");
        assert_eq!(AuditOptions::new("").container_name(), "audit");
        assert_eq!(AuditOptions::new("").table_name(), "Audit");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sanitised_prefix_is_alphanumeric_and_bounded(raw in ".{0,120}") {
                let prefix = sanitize_prefix(&raw);
                prop_assert!(prefix.chars().count() <= MAX_PREFIX_LEN);
                prop_assert!(prefix.chars().all(char::is_alphanumeric));
                if let Some(first) = prefix.chars().next() {
                    prop_assert!(!first.is_numeric());
                }
            }

            #[test]
            fn sanitising_is_idempotent(raw in "[a-zA-Z0-9_-]{0,60}") {
                let once = sanitize_prefix(&raw);
                prop_assert_eq!(sanitize_prefix(&once), once.clone());
            }
        }
    }
}
