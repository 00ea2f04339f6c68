//! Error types for target core operations

use thiserror::Error;

/// Target core errors
#[derive(Debug, Error)]
pub enum ScsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for target core operations
pub type ScsiResult<T> = Result<T, ScsiError>;
