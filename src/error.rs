//! Server error taxonomy
//!
//! Every failure below the protocol loop is downgraded to a response-level
//! error: the `Display` text of a `ServerError` becomes the `error` string on
//! the wire. Only startup failures (config, model load) terminate the process.

use crate::backend::BackendError;
use crate::extract::ExtractError;

/// Result type for request handling
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving requests
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing or invalid parameter: {message}")]
    Protocol { message: String },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("{0}")]
    Extraction(#[from] ExtractError),

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {error}")]
    Io { error: std::io::Error },
}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        ServerError::Io { error }
    }
}

impl ServerError {
    /// Convenience constructor for missing-parameter errors.
    pub fn missing_param(name: &str) -> Self {
        ServerError::Protocol {
            message: format!("missing required parameter '{}'", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::UnknownMethod {
            method: "frobnicate".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown method: frobnicate");

        let err = ServerError::missing_param("paths");
        assert!(err.to_string().contains("'paths'"));
    }
}
