//! Broadcast relay for serial terminal viewers.
//!
//! Each WebSocket at `/ws` is one participant. Participants declare their baud
//! rate, publish lines they read from their device, and receive every line the
//! others publish exactly once. A participant declaring a rate that differs
//! from the room's gets everyone sent `disconnectAll`.

pub mod config;
pub mod generator;
pub mod hub;
pub mod metrics;
pub mod websocket;

pub use config::{RelayFileConfig, load_config};
pub use hub::{HubConfig, ParticipantId, ParticipantState, PublishOutcome, RateOutcome, RelayHub};
pub use metrics::{MetricsSnapshot, RelayMetrics};

use axum::{
    Json, Router,
    extract::{State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

#[derive(Clone)]
pub struct RelayState {
    pub hub: Arc<RelayHub>,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayState {
    pub fn new(config: HubConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::new());
        Self {
            hub: Arc::new(RelayHub::new(config, metrics.clone())),
            metrics,
        }
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

/// Routes: `/ws`, `/health`, `/api/stats`, and the static UI as fallback when given.
pub fn create_router(state: RelayState, static_dir: Option<&Path>) -> Router {
    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, state.hub, state.metrics))
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn stats(State(state): State<RelayState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
