//! CLI-specific error types
//!
//! Every CLI error is fatal: `main` prints it and exits non-zero.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::durable_log::LogError;
use crate::observability::ObservabilityError;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] ObservabilityError),

    #[error("Durable log unavailable: {0}")]
    DurableLog(#[from] LogError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Benchmark failed: {0}")]
    Bench(String),
}
