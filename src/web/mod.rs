//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::service::QueryService;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
}

/// Web server for HealthTrail.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, service: Arc<QueryService>) -> Self {
        Self {
            config,
            state: AppState { service },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/", get(handlers::handle_index))
            // Ingest
            .route("/add", post(handlers::handle_add))
            // Live checks
            .route("/healthcheck", get(handlers::handle_healthcheck_all))
            .route("/healthcheck/{service_name}", get(handlers::handle_healthcheck_one))
            // Stored observations
            .route("/history", get(handlers::handle_history))
            .route("/latest/{service_name}", get(handlers::handle_latest))
            .fallback(handlers::handle_not_found)
            .method_not_allowed_fallback(handlers::handle_method_not_allowed)
            .layer(CatchPanicLayer::custom(handlers::handle_panic))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
