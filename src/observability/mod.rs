//! Observability subsystem for the relay
//!
//! - Structured logging through `tracing` (pretty or JSON)
//! - Per-stream counters and a processing-time histogram
//!
//! # Usage
//!
//! ```ignore
//! use streamrelay::observability::{init_logging, RelayMetrics};
//!
//! init_logging(&config.logging)?;
//!
//! let metrics = RelayMetrics::new();
//! metrics.increment_streams_created();
//! println!("{}", metrics.render_prometheus());
//! ```

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::{
    HistogramSnapshot, MetricsSnapshot, RelayMetrics, StreamMetricsSnapshot,
    PROCESSING_TIME_BUCKETS,
};

use thiserror::Error;

/// Result type for observability operations
pub type ObservabilityResult<T> = Result<T, ObservabilityError>;

/// Observability failures are reported but never fatal to the relay
#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to install log subscriber: {0}")]
    Logging(String),
}
