//! Internal error type for the fetch-controller framework.
//!
//! This is distinct from the generic fetch-error type `E` carried by
//! [`crate::state::QueryState`] and [`crate::state::MutationState`]: values of
//! this type originate from the framework's own plumbing (the cache backend,
//! the serialization envelope, configuration) and are always caught and
//! logged at the boundary where they occur. They never reach user code as an
//! `E`.

use std::fmt;

/// Result type for internal framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types produced by the framework's own plumbing.
///
/// All cache backend and serialization operations return `Result<T>`.
/// `CacheManager` catches every variant internally (see the crate's error
/// handling design) and never lets one escape to a controller.
#[derive(Debug, Clone)]
pub enum Error {
    /// Serialization failed when converting a value to cache bytes.
    SerializationError(String),

    /// Deserialization failed when converting cache bytes to a value.
    ///
    /// Indicates corrupted or malformed data in the cache; the entry should
    /// be evicted and recomputed.
    DeserializationError(String),

    /// Backend storage error (connection lost, protocol error, etc).
    BackendError(String),

    /// Operation exceeded a configured timeout threshold.
    Timeout(String),

    /// Configuration error during controller or backend construction.
    ConfigError(String),

    /// Requested feature or operation is not implemented for this backend.
    NotImplemented(String),

    /// Invalid cache entry: corrupted envelope or bad magic.
    InvalidCacheEntry(String),

    /// Schema version mismatch between code and cached data.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from the cached entry)
        found: u32,
    },

    /// Generic error with a custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "deserialization error: {}", msg),
            Error::BackendError(msg) => write!(f, "backend error: {}", msg),
            Error::Timeout(msg) => write!(f, "timeout: {}", msg),
            Error::ConfigError(msg) => write!(f, "config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "not implemented: {}", msg),
            Error::InvalidCacheEntry(msg) => write!(f, "invalid cache entry: {}", msg),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "cache schema version mismatch: expected {}, found {}",
                expected, found
            ),
            Error::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::BackendError("connection reset".to_string());
        assert_eq!(err.to_string(), "backend error: connection reset");
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "boom".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_version_mismatch_display() {
        let err = Error::VersionMismatch {
            expected: 2,
            found: 1,
        };
        assert_eq!(
            err.to_string(),
            "cache schema version mismatch: expected 2, found 1"
        );
    }
}
