//! # Relay HTTP Server Module
//!
//! Axum front end of the relay.
//!
//! # Endpoints
//!
//! - `/health` - Health check
//! - `/metrics` - Prometheus text exposition
//! - `/stream/*` - Stream creation, ingress and WebSocket results
//! - `/observability/*` - Health and JSON metrics

pub mod admission;
pub mod errors;
pub mod observability_routes;
pub mod server;
pub mod stream_routes;

pub use errors::{ApiError, ApiResult, ErrorResponse};
pub use server::HttpServer;
