//! Transform errors

use thiserror::Error;

/// Result type for payload transforms
pub type TransformResult<T> = Result<T, TransformError>;

#[derive(Debug, Error)]
pub enum TransformError {
    /// Payload is not well-formed JSON
    #[error("Malformed JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Payload is JSON but not an object
    #[error("Payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}
