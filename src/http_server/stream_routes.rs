//! Stream HTTP Routes and WebSocket Handler
//!
//! - `POST /stream/start` creates a stream
//! - `POST /stream/:stream_id/send` accepts a JSON payload into the durable log
//! - `GET /stream/:stream_id/results` upgrades to a WebSocket subscriber

use std::sync::Arc;

use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::admission::admission;
use super::errors::{ApiError, ApiResult};
use crate::auth::API_KEY_HEADER;
use crate::config::TransformStage;
use crate::context::Relay;
use crate::hub::{ConnectionTimings, StreamId, SubscriberConnection};
use crate::transform;

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Serialize, Deserialize)]
pub struct StartStreamResponse {
    pub stream_id: StreamId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendAcceptedResponse {
    pub status: String,
}

// ==================
// Router
// ==================

/// Create stream routes
pub fn stream_routes(relay: Arc<Relay>) -> Router {
    let send = post(send_data)
        .route_layer(middleware::from_fn_with_state(Arc::clone(&relay), admission));

    Router::new()
        .route("/start", post(start_stream))
        .route("/:stream_id/send", send)
        .route("/:stream_id/results", get(stream_results))
        .with_state(relay)
}

fn authorize(relay: &Relay, headers: &HeaderMap) -> ApiResult<()> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    relay.api_keys.verify(presented).map_err(|e| {
        debug!(error = %e, "Rejected credentials");
        ApiError::from(e)
    })
}

async fn ensure_exists(relay: &Relay, stream_id: &StreamId) -> ApiResult<()> {
    if relay.hub.stream_exists(stream_id).await? {
        Ok(())
    } else {
        warn!(stream_id = %stream_id, "Stream not found");
        Err(ApiError::StreamNotFound(stream_id.clone()))
    }
}

// ==================
// Handlers
// ==================

async fn start_stream(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
) -> ApiResult<Json<StartStreamResponse>> {
    authorize(&relay, &headers)?;

    let stream_id = StreamId::generate();
    relay.hub.create_stream(stream_id.clone()).await?;
    relay.metrics.increment_streams_created();

    info!(stream_id = %stream_id, "New stream created");
    Ok(Json(StartStreamResponse { stream_id }))
}

async fn send_data(
    State(relay): State<Arc<Relay>>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SendAcceptedResponse>)> {
    authorize(&relay, &headers)?;

    let stream_id = StreamId::new(stream_id);
    ensure_exists(&relay, &stream_id).await?;
    relay.metrics.increment_received(&stream_id);

    let prepared = match relay.config.transform_stage {
        TransformStage::Consumer => transform::canonicalize(&body),
        TransformStage::Ingress => transform::process(&body),
    };
    let payload = prepared.map_err(|e| {
        warn!(stream_id = %stream_id, error = %e, "Invalid payload");
        ApiError::from(e)
    })?;

    relay.producer.send(&stream_id, Bytes::from(payload)).await?;

    debug!(stream_id = %stream_id, "Data sent to stream");
    Ok((
        StatusCode::ACCEPTED,
        Json(SendAcceptedResponse {
            status: "accepted".to_string(),
        }),
    ))
}

async fn stream_results(
    State(relay): State<Arc<Relay>>,
    Path(stream_id): Path<String>,
    upgrade: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let stream_id = StreamId::new(stream_id);
    ensure_exists(&relay, &stream_id).await?;

    let upgrade = upgrade.ok_or(ApiError::UpgradeRequired)?;
    let max_frame = relay.config.connection.max_frame_bytes;

    Ok(upgrade
        .max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| attach_subscriber(relay, stream_id, socket))
        .into_response())
}

/// Register the upgraded socket with the hub and start its tasks
async fn attach_subscriber(relay: Arc<Relay>, stream_id: StreamId, socket: WebSocket) {
    match relay.hub.register(stream_id.clone()).await {
        Ok(subscription) => {
            let timings = ConnectionTimings::from(&relay.config.connection);
            let connection = SubscriberConnection::new(relay.hub.clone(), subscription, timings);
            debug!(stream_id = %stream_id, connection_id = %connection.id(), "WebSocket attached");
            connection.spawn(socket);
        }
        // Dropping the socket closes it without frames
        Err(e) => warn!(stream_id = %stream_id, error = %e, "Subscriber registration failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_response_shape() {
        let body = StartStreamResponse {
            stream_id: StreamId::new("stream-1"),
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"stream_id":"stream-1"}"#
        );
    }

    #[test]
    fn test_accepted_response_shape() {
        let body = SendAcceptedResponse {
            status: "accepted".to_string(),
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"status":"accepted"}"#);
    }
}
