//! saltline-core: client library for the Salt REST API.
//!
//! Authenticates once and caches the session token on disk, dispatches
//! jobs against targets, queries minions/jobs/stats, and decodes the
//! server-push event feed.

pub mod api;
pub mod auth;
pub mod config;
pub mod diagnostics;

#[cfg(test)]
mod testing;

pub use api::{Error, Event, EventStream, Result, SaltClient, TransportError, TransportErrorKind};
pub use auth::{Credential, CredentialStore, LoginParams, SessionManager};
pub use config::ClientConfig;
pub use diagnostics::{DiagnosticSink, MemorySink, StderrSink};
