//! Process-wide logging setup shared by the binaries.

/// Initialize tracing with the format chosen by `TEAMCLOUD_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use tracing::{init_with, LogFormat, LOG_FORMAT_ENV};
