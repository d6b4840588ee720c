//! HTTP surface: signaling WebSocket, health checks, static assets.

pub mod health;
pub mod websocket;

use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use solocast_sfu::{Config, RegistryHandle};

#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
    pub started_at: Instant,
    pub started_wall: chrono::DateTime<chrono::Utc>,
    pub keepalive: Duration,
}

pub fn router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(health::health))
        .route("/ping", get(health::ping))
        .fallback_service(ServeDir::new(&config.server.static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
