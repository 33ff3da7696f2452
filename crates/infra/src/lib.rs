//! Infrastructure layer: storage, locking, auditing, provider dispatch and
//! command orchestration.
//!
//! Storage backends sit behind the [`storage::BlobStore`] and
//! [`storage::TableStore`] traits; everything above them (locks, audit,
//! authorization stores, the orchestration engine) only talks to those
//! traits, so the in-memory doubles drive the whole stack in tests.

pub mod audit;
pub mod authorization;
pub mod config;
pub mod dispatch;
pub mod lock;
pub mod monitoring;
pub mod orchestration;
pub mod retry;
pub mod storage;

pub use config::EngineOptions;
pub use orchestration::{EngineError, OrchestrationEngine};
