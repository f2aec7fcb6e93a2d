//! Error types for batchflow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid key expression `{expression}`: {reason}")]
    KeyExpression { expression: String, reason: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The workflow no longer accepts new runs (closed or at capacity).
    #[error("workflow {workflow} is not accepting runs: {reason}")]
    Closed { workflow: String, reason: String },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
