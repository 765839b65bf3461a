//! # Hub Errors
//!
//! Error types for the stream registry and broadcast hub.

use thiserror::Error;

use super::message::StreamId;

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

/// Hub errors
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// Stream was never created (or has been pruned)
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The hub actor is no longer running
    #[error("Hub has stopped")]
    Stopped,
}

impl HubError {
    /// Whether the error is caused by the caller rather than the hub
    pub fn is_client_error(&self) -> bool {
        matches!(self, HubError::StreamNotFound(_))
    }
}
