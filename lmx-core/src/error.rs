//! Error types for the LMX core library.
//!
//! Uses `thiserror` for public API error types. Runtime-specific failures
//! (loader, admission, inference) live in `lmx-engine`; this crate only covers
//! configuration and on-disk persistence.

use std::path::PathBuf;

/// Top-level error type for the LMX core library.
#[derive(Debug, thiserror::Error)]
pub enum LmxError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error at {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, LmxError>;
