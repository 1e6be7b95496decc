//! Error types shared across DIP crates

use thiserror::Error;

/// Result type alias for shared DIP operations
pub type Result<T> = std::result::Result<T, DipError>;

/// Errors raised by shared setup code (configuration, logging, IO)
#[derive(Error, Debug)]
pub enum DipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

impl DipError {
    /// Build an error for an environment variable that failed to parse
    pub fn invalid_env(name: impl Into<String>, value: impl Into<String>) -> Self {
        DipError::InvalidEnv {
            name: name.into(),
            value: value.into(),
        }
    }
}
