//! Error type shared by every numbering operation.

use thiserror::Error;

/// Errors that can occur while resolving, advancing or rendering a sequence.
#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("Cannot reset on period '{0}'. Allowed: y, m, w, d, h")]
    InvalidResetContext(String),
    #[error("Field '{0}' not found on record")]
    UnknownField(String),
    #[error("Cannot write field '{field}': {reason}")]
    FieldAccess { field: String, reason: String },
    #[error("Invalid sequence configuration: {0}")]
    InvalidConfig(String),
    #[error("Concurrent modification of counter {key}/{}", .segment.as_deref().unwrap_or("-"))]
    Conflict {
        key: String,
        segment: Option<String>,
    },
    #[error("Counter store error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
