//! # Auth Errors

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Credential check failures
///
/// Both variants map to 401. The message never says which keys exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `X-API-Key` header on the request
    #[error("Missing API key")]
    MissingApiKey,

    /// Header present but no configured key matches
    #[error("Invalid API key")]
    InvalidApiKey,
}
