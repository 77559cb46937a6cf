//! Error types for cloudbd
//!
//! This module defines the errors a remote object store can report. The
//! block layer wraps them; only [`Error::RateLimited`] is ever retried.

use thiserror::Error;

/// Common result type for remote-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for remote-store operations
#[derive(Debug, Error)]
pub enum Error {
    // Throttling
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    // Lookup errors
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    // Backend errors
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the store rejected the call for exceeding its request rate
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_) | Self::ObjectNotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_limited() {
        assert!(Error::RateLimited("userRateLimitExceeded".into()).is_rate_limited());
        assert!(!Error::Storage("boom".into()).is_rate_limited());
        assert!(!Error::AccessDenied("ro".into()).is_rate_limited());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::ContainerNotFound("dev".into()).is_not_found());
        assert!(Error::ObjectNotFound("obj".into()).is_not_found());
        assert!(!Error::RateLimited("x".into()).is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = Error::RateLimited("rateLimitExceeded".into());
        assert_eq!(err.to_string(), "rate limit exceeded: rateLimitExceeded");
    }
}
