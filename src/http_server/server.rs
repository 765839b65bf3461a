//! # HTTP Server
//!
//! Main HTTP server combining the stream and observability routers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::observability_routes::{health_routes, observability_routes};
use super::stream_routes::stream_routes;
use crate::config::ServerConfig;
use crate::context::Relay;

/// HTTP front end of a running relay
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(relay: Arc<Relay>) -> Self {
        let config = relay.config.server.clone();
        let router = Self::build_router(relay);
        Self { config, router }
    }

    /// Build the combined router with all endpoints
    pub fn build_router(relay: Arc<Relay>) -> Router {
        let cors = if relay.config.server.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = relay
                .config
                .server
                .cors_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            // Health check and Prometheus scrape at root level
            .merge(health_routes(Arc::clone(&relay)))
            .nest("/stream", stream_routes(Arc::clone(&relay)))
            .nest("/observability", observability_routes(relay))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
    }

    /// Get the socket address
    pub fn socket_addr(&self) -> String {
        self.config.socket_addr()
    }

    /// Get the router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.socket_addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, "Relay HTTP server listening");
        info!("Health check: http://{}/health", addr);

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
