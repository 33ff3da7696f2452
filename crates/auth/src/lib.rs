//! `teamcloud-auth` — authorization sessions and provider tokens.
//!
//! Sessions are short-lived records of an in-flight OAuth-style handshake;
//! tokens are the durable credentials it yields. Both are keyed by an
//! [`AuthorizationIdentity`] derived from (organization, deployment scope)
//! and partitioned by the concrete adapter type.
//!
//! This crate is decoupled from HTTP; table-backed stores live in the
//! infrastructure layer.

pub mod error;
pub mod identity;
pub mod session;
pub mod store;
pub mod token;

pub use error::AuthStoreError;
pub use identity::AuthorizationIdentity;
pub use session::{AuthorizationSession, DEFAULT_SESSION_TTL};
pub use store::{
    AuthorizationSessionStore, AuthorizationTokenStore, InMemorySessionStore, InMemoryTokenStore,
};
pub use token::AuthorizationToken;
