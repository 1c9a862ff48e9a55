//! Error types for the RouterOS administration client

use std::time::Duration;

use thiserror::Error;

/// Main client error type
///
/// Transport, protocol, and router errors bubble to the caller unmodified so
/// operational state (status, detail) survives. Classifier methods over
/// [`Error::Router`] mirror the REST status semantics; they also apply to
/// `!trap` replies, which carry no status.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or refused configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket I/O, DNS, or connection failure
    #[error("IO error")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure (connection refused, DNS, body read)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS handshake or certificate error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed length prefix, oversized word, or unsolicited reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Login refused or invalid challenge format
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// `!trap` reply or non-2xx REST response
    #[error("RouterOS error{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Router {
        detail: String,
        /// HTTP status for REST responses; `None` for socket traps.
        status: Option<u16>,
        /// The command path that produced the error, when known.
        command: Option<String>,
        /// Unparsed response body, for debugging.
        raw: Option<String>,
    },

    /// Rejected by the circuit breaker without an attempt
    #[error("Circuit open -- retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// Request or connect deadline exceeded
    #[error("Timed out after {elapsed:?}: {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Duplicate detected but the recovery query returned nothing
    #[error("Idempotency recovery found no row for {key}={value}")]
    IdempotencyLost { key: String, value: String },

    /// Pending operation abandoned by connection drop
    #[error("Connection lost with operations pending")]
    ConnectionLost,
}

impl Error {
    /// Build a router error from a `!trap` message.
    pub(crate) fn trap(detail: impl Into<String>) -> Self {
        Self::Router {
            detail: detail.into(),
            status: None,
            command: None,
            raw: None,
        }
    }

    /// Returns `true` for HTTP 404.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Router { status: Some(404), .. })
    }

    /// Returns `true` for HTTP 401 or a refused login.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::Router { status: Some(401), .. } | Self::Auth(_)
        )
    }

    /// Returns `true` for HTTP 403.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Router { status: Some(403), .. })
    }

    /// Returns `true` for HTTP 429.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Router { status: Some(429), .. })
    }

    /// Returns `true` if retrying the same operation may succeed.
    ///
    /// Advisory only; the client itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Router {
                status: Some(429 | 502 | 503 | 504),
                ..
            }
        )
    }

    /// Returns `true` when the router reported that the object already
    /// exists. REST signals this with HTTP 400; socket traps carry only the
    /// message.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        match self {
            Self::Router {
                status: Some(400) | None,
                detail,
                ..
            } => detail.contains("already exists") || detail.contains("already have"),
            _ => false,
        }
    }
}

/// Convenient alias for Result with the client error
pub type Result<T> = std::result::Result<T, Error>;
