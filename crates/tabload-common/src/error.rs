//! Error types shared across tabload crates

use thiserror::Error;

/// Result type alias for tabload operations
pub type Result<T> = std::result::Result<T, TabloadError>;

/// Errors that are not specific to a single pipeline stage
#[derive(Error, Debug)]
pub enum TabloadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl TabloadError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TabloadError::Config(message.into())
    }
}
