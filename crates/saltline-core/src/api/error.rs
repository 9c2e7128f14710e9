use std::fmt;

use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Malformed event payload: {0}")]
    MalformedEvent(String),

    #[error("Unexpected response shape: {0}")]
    Protocol(String),

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Credential storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// HTTP 401 from the service
    AuthDenied,
    /// Any 5xx status
    ServerError,
    /// Connection refused, reset, timed out or dropped mid-stream
    NetworkError,
    /// Any other non-success status
    Status(u16),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::AuthDenied => write!(f, "authentication denied"),
            TransportErrorKind::ServerError => write!(f, "server error"),
            TransportErrorKind::NetworkError => write!(f, "network error"),
            TransportErrorKind::Status(code) => write!(f, "HTTP {}", code),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {detail}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        let kind = match status.as_u16() {
            401 => TransportErrorKind::AuthDenied,
            500..=599 => TransportErrorKind::ServerError,
            code => TransportErrorKind::Status(code),
        };
        let detail = if truncated.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, truncated)
        };
        Self::new(kind, detail)
    }

    pub fn network(err: &reqwest::Error) -> Self {
        Self::new(TransportErrorKind::NetworkError, err.to_string())
    }
}

impl Error {
    /// The transport failure class, if this error came from the wire.
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Error::Transport(e) => Some(e.kind),
            _ => None,
        }
    }
}
