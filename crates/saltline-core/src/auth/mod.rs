//! Authentication module for managing sessions and the cached token.
//!
//! This module provides:
//! - `CredentialStore`: the on-disk token record shared across invocations
//! - `SessionManager`: reuse-or-refresh login, logout, token injection
//!
//! A cached token is reused until 30 seconds before its expiry.

pub mod credentials;
pub mod session;

pub use credentials::{now_epoch, Credential, CredentialStore, EXPIRY_GRACE_SECS};
pub use session::{Action, Effect, LoginParams, SessionManager, SessionState};
