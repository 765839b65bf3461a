//! Configuration errors

use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    /// Config file is not valid JSON for `RelayConfig`
    #[error("Invalid config JSON: {0}")]
    Parse(String),

    /// Environment override could not be parsed
    #[error("Invalid value for {key}: '{value}'")]
    Env { key: String, value: String },

    /// A field failed validation
    #[error("Invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
