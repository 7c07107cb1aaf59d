//! Centralized error types for A3S Serve

use thiserror::Error;

/// Serve error types
#[derive(Debug, Error)]
pub enum ServeError {
    /// Malformed or inconsistent input from the caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation would violate a uniqueness or in-use invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown endpoint, backend, or controller
    #[error("Not found: {0}")]
    NotFound(String),

    /// A selected replica failed or was unreachable
    #[error("Upstream error from backend '{backend}': {message}")]
    Upstream { backend: String, message: String },

    /// Controller not initialized or not reachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Checkpoint could not be written or read
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid process configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The replica runtime could not spawn or stop a replica
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A replica's callable failed
    #[error("Replica error: {0}")]
    Replica(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a [`ServeError`], stable across message changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Upstream,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// HTTP status code used by the listener when surfacing this kind
    pub fn status_code(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Conflict => 409,
            Self::NotFound => 404,
            Self::Upstream => 502,
            Self::Unavailable => 503,
            Self::Internal => 500,
        }
    }
}

impl ServeError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// Wrap a replica failure with the backend it came from
    pub fn upstream(backend: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Upstream {
            backend: backend.into(),
            message: cause.to_string(),
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, ServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ServeError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ServeError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(ServeError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            ServeError::upstream("b", "boom").kind(),
            ErrorKind::Upstream
        );
        assert_eq!(
            ServeError::Unavailable("x".into()).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            ServeError::Checkpoint("disk full".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Upstream.status_code(), 502);
        assert_eq!(ErrorKind::Unavailable.status_code(), 503);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn test_upstream_message_names_backend() {
        let err = ServeError::upstream("model:v2", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("model:v2"));
        assert!(msg.contains("connection refused"));
    }
}
