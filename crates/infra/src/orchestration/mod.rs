//! Orchestration engine.
//!
//! Every submitted command runs as its own task. Project-scoped commands pass
//! through the [`ProjectSerializer`] first, so at most one command per project
//! is active and they activate in submission order. Each status transition is
//! published to waiters, appended to the [`OrchestrationJournal`] and written
//! to the audit trail.
//!
//! ```text
//! submit ─▶ Pending ─▶ wait turn ─▶ Running ─▶ handler | provider ─▶ final
//!              │                       │                              │
//!              └──── journal + audit ──┴──────── journal + audit ─────┘
//! ```

pub mod engine;
pub mod handlers;
pub mod journal;
pub mod serializer;

pub use engine::{EngineBuilder, OrchestrationEngine};
pub use handlers::{
    handler_fn, AdapterCommandHandler, CommandHandler, HandlerError, HandlerRegistry,
    ProviderCatalog,
};
pub use journal::{InMemoryJournal, JournalEntry, OrchestrationJournal, TableJournal};
pub use serializer::ProjectSerializer;

use std::time::Duration;

use thiserror::Error;

use teamcloud_commands::CommandValidationError;
use teamcloud_core::CommandId;

use crate::dispatch::DispatchError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid command: {0}")]
    Validation(#[from] CommandValidationError),

    #[error("command {0} was already submitted")]
    Duplicate(CommandId),

    #[error("command {0} not found")]
    NotFound(CommandId),

    #[error("command timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },

    #[error("no handler or provider registered for {0}")]
    NoRoute(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("journal error: {0}")]
    Journal(#[from] StorageError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}
