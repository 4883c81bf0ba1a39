//! Error types for Sift
//!
//! Errors shared by configuration loading, identity assignment and name
//! validation. Storage and index layers define their own enums and wrap
//! this one where needed.

use crate::types::NameError;
use thiserror::Error;

/// Common result type for Sift operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Sift
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] NameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("request timeout")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Configuration errors are fatal at startup
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::configuration("bad node").is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::configuration("unknown backend").is_fatal());
        assert!(!Error::internal("oops").is_fatal());
    }

    #[test]
    fn test_name_error_converts() {
        let err: Error = NameError::Empty.into();
        assert!(matches!(err, Error::InvalidName(NameError::Empty)));
    }
}
