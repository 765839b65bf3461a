//! # HTTP API Errors
//!
//! Error taxonomy of the ingress routes and its status code mapping.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::durable_log::LogError;
use crate::hub::{HubError, StreamId};
use crate::transform::TransformError;

/// Result type for route handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    // ==================
    // Client Errors (4xx)
    // ==================
    /// Malformed ingress payload
    #[error("Invalid payload: {0}")]
    Validation(#[from] TransformError),

    /// Missing or unknown API key
    #[error("Unauthorized: {0}")]
    Auth(#[from] AuthError),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Plain HTTP request on the subscribe endpoint
    #[error("WebSocket upgrade required")]
    UpgradeRequired,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Duration },

    // ==================
    // Server Errors (5xx)
    // ==================
    /// The durable log failed or timed out
    #[error("Failed to send message: {0}")]
    Downstream(#[from] LogError),

    /// The hub has stopped
    #[error("Relay unavailable: {0}")]
    Hub(HubError),
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::StreamNotFound(id) => ApiError::StreamNotFound(id),
            other => ApiError::Hub(other),
        }
    }
}

impl ApiError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Downstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Hub(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            code: err.status_code().as_u16(),
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(ErrorResponse::from(&self))).into_response();

        if let ApiError::RateLimited { retry_after } = self {
            let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
