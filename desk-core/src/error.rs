//! Error types for the desk crates

use thiserror::Error;

/// Workspace-wide error type
#[derive(Error, Debug)]
pub enum DeskError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeskError {
    pub fn network(msg: impl Into<String>) -> Self {
        DeskError::Network(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        DeskError::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        DeskError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DeskError::Internal(msg.into())
    }
}

/// Result type alias for desk operations
pub type DeskResult<T> = Result<T, DeskError>;
