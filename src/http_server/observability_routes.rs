//! Observability HTTP Routes
//!
//! Health check plus metrics in JSON and Prometheus text form.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::context::Relay;
use crate::observability::MetricsSnapshot;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub streams: usize,
    pub subscribers: usize,
}

/// Create observability routes
pub fn observability_routes(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(relay)
}

/// Root-level health check and Prometheus scrape endpoint
pub fn health_routes(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(prometheus_handler))
        .with_state(relay)
}

/// Health check handler; 503 once the hub has stopped
async fn health_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    let (status, stats) = match relay.hub.stats().await {
        Ok(stats) => (StatusCode::OK, stats),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Default::default()),
    };

    let response = HealthResponse {
        status: if status.is_success() { "ok" } else { "unavailable" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: relay.uptime().as_secs(),
        streams: stats.streams,
        subscribers: stats.subscribers,
    };

    (status, Json(response))
}

/// Metrics handler - returns metrics as JSON
async fn metrics_handler(State(relay): State<Arc<Relay>>) -> Json<MetricsSnapshot> {
    Json(relay.metrics.snapshot())
}

async fn prometheus_handler(State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        relay.metrics.render_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            uptime_secs: 3,
            streams: 2,
            subscribers: 5,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""status":"ok""#));
        assert!(json.contains(r#""subscribers":5"#));
    }
}
