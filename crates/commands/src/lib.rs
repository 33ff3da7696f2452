//! Command model: the typed envelope flowing through the orchestration engine.
//!
//! A [`Command`] is immutable once created. The engine owns the matching
//! [`CommandResult`] and mutates it on every status transition.

pub mod command;
pub mod error;
pub mod message;
pub mod result;
pub mod status;

pub use command::{Command, CommandAction, CommandPayload};
pub use error::{CommandError, CommandValidationError, Severity};
pub use message::CommandMessage;
pub use result::{CommandResult, STATUS_LINK};
pub use status::RuntimeStatus;
