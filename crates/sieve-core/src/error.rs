//! Configuration error types following panic-free policy.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading the fleet configuration.
///
/// A failed load never touches the configuration that was previously
/// committed to the store.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    /// The document does not match either schema version
    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    /// The document parsed but a field holds an unusable value
    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    /// Creates a parse error from any displayable error.
    pub fn parse<E: std::fmt::Display>(err: E) -> Self {
        Self::Parse {
            reason: err.to_string(),
        }
    }

    /// Creates a validation error for a named field.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
