//! Error types for the epochal engine

use thiserror::Error;

/// Main error type for engine, trainer and hook operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input handed to an engine or hook
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint save/restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory traversal error
    #[error("Directory traversal error: {0}")]
    Walk(#[from] walkdir::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Binary state serialization error
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Layered configuration source error
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Errors raised by user-supplied handlers
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for epochal operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
