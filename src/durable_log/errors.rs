//! Durable log errors

use std::time::Duration;

use thiserror::Error;

/// Result type for durable log operations
pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
    // ==================
    // Produce errors
    // ==================
    /// The log did not acknowledge a record within the delivery timeout
    #[error("Delivery of record for stream {stream_id} timed out after {timeout:?}")]
    DeliveryTimeout { stream_id: String, timeout: Duration },

    /// The broker rejected or failed the request
    #[error("Broker error: {0}")]
    Broker(String),

    // ==================
    // Consume errors
    // ==================
    /// Commit referenced a record this consumer never handed out
    #[error("Cannot commit offset {offset} on {topic}/{partition}: {reason}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    /// The log has been closed
    #[error("Durable log closed")]
    Closed,
}

impl LogError {
    /// Errors a retry can plausibly clear
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::DeliveryTimeout { .. } | LogError::Broker(_))
    }
}
