//! REST API client module for the Salt API.
//!
//! This module provides the `SaltClient` for dispatching jobs and querying
//! minions, jobs and stats, the `Transport` abstraction it runs on, and the
//! decoder for the `/events` feed.
//!
//! Authenticated calls carry the session token in the `X-Auth-Token`
//! header obtained from `POST /login`.

pub mod client;
pub mod error;
pub mod events;
pub mod transport;

pub use client::{return_list, unwrap_return, SaltClient};
pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use events::{Event, EventDecoder, EventStream};
pub use transport::{HttpTransport, LineStream, Method, Request, Transport, AUTH_HEADER};
