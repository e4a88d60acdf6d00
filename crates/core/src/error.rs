//! Error types
//!
//! Provider failures are split into transient and fatal classes; the
//! orchestrator retries the former and cancels the turn on the latter.
//! Late or duplicate stream events are not errors at all — they are logged
//! and dropped where they arrive.

use std::time::Duration;
use thiserror::Error;

/// Result alias using the shared error type
pub type Result<T> = std::result::Result<T, Error>;

/// Result alias for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Top-level error type shared across crates
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("session event queue closed")]
    ChannelClosed,
}

impl Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Check whether this is a not-found error (maps to HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Errors reported by a provider sub-stream
///
/// Classification drives the retry policy: transient errors enter the
/// bounded backoff path, fatal errors cancel the turn immediately.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider rate limited")]
    RateLimited,

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed provider response: {0}")]
    Protocol(String),

    #[error("provider quota exhausted")]
    QuotaExhausted,
}

impl ProviderError {
    /// Transient errors are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::RateLimited
                | ProviderError::ConnectionReset(_)
        )
    }

    /// Fatal errors cancel the turn without retrying
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
    }
}
