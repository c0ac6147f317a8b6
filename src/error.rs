//! Error types for turbine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for turbine operations
#[derive(Error, Debug)]
pub enum TurbineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("Invalid job manifest: {0}")]
    Manifest(String),

    #[error("Invalid resource name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Could not decode task message: {0}")]
    TaskDecode(String),

    #[error("Task execution error: {0}")]
    Execution(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{service} API error ({status}): {message}")]
    Api {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for turbine operations
pub type Result<T> = std::result::Result<T, TurbineError>;

impl TurbineError {
    /// Create a new manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an API error for a cloud service response
    pub fn api(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            service,
            status,
            message: message.into(),
        }
    }

    /// Create an invalid name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a file not found error
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// HTTP status carried by an API error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the error is a 404 from a cloud API or a missing local object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::FileNotFound { .. }) || self.status() == Some(404)
    }

    /// True when the error is a 409 conflict from a cloud API
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        let err = TurbineError::api("pubsub", 404, "Resource not found");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert_eq!(err.to_string(), "pubsub API error (404): Resource not found");

        let err = TurbineError::api("storage", 409, "exists");
        assert!(err.is_conflict());
    }
}
