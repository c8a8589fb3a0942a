use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tb_core::config::Config;
use tb_core::types::SessionSummary;
use tb_session::registry::SessionRegistry;
use tb_session::spawn::CommandResolver;
use tb_session::validator::InputValidator;
use tb_telemetry::tracing_setup::request_id_middleware;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::session_ws;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Everything a request handler needs, shared behind an `Arc`.
pub struct BridgeState {
    pub registry: Arc<SessionRegistry>,
    pub resolver: Arc<dyn CommandResolver>,
    pub validator: InputValidator,
    /// Ping period for bound WebSockets.
    pub heartbeat_interval: Duration,
    /// Events buffered per connection before it counts as lagging.
    pub client_queue_depth: usize,
    pub started_at: Instant,
}

impl BridgeState {
    pub fn new(registry: Arc<SessionRegistry>, resolver: Arc<dyn CommandResolver>) -> Self {
        Self {
            registry,
            resolver,
            validator: InputValidator::default(),
            heartbeat_interval: Duration::from_secs(30),
            client_queue_depth: 256,
            started_at: Instant::now(),
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn CommandResolver>,
    ) -> Self {
        Self {
            validator: InputValidator::with_max_bytes(config.input.max_message_bytes),
            heartbeat_interval: config.websocket.heartbeat_interval(),
            client_queue_depth: config.websocket.client_queue_depth,
            ..Self::new(registry, resolver)
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_validator(mut self, validator: InputValidator) -> Self {
        self.validator = validator;
        self
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the HTTP + WebSocket router.
pub fn api_router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", axum::routing::delete(close_session))
        .route("/ws/sessions/{key}", get(session_ws::session_ws))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    sessions: usize,
}

/// GET /health
async fn health(State(state): State<Arc<BridgeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        sessions: state.registry.len(),
    })
}

/// GET /api/sessions: live sessions, oldest first.
async fn list_sessions(State(state): State<Arc<BridgeState>>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list_alive())
}

/// DELETE /api/sessions/{id}: terminate a session and its process group.
async fn close_session(
    State(state): State<Arc<BridgeState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session_id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid session id: {id}")))?;
    if !state.registry.close(session_id).await {
        return Err(ApiError::NotFound(format!("session {session_id} not found")));
    }
    info!(%session_id, "session closed via api");
    Ok(Json(serde_json::json!({ "closed": session_id })))
}
