//! HTTP endpoints
//!
//! Health checks plus the metrics surface: aggregate summary, per-session
//! latency/cost history, session listing and teardown.

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use voicebridge_session::{AggregateMetrics, SessionMetrics};

use crate::metrics::prometheus_handler;
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.settings.server.cors_origins,
        state.settings.server.cors_enabled,
    );

    Router::new()
        // Health
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Metrics surface
        .route("/metrics", get(get_metrics))
        .route("/metrics/prometheus", get(prometheus_handler))
        .route("/metrics/:session_id", get(get_session_metrics))
        // Session lifecycle
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", delete(terminate_session))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
///
/// An empty origin list falls back to localhost rather than a wildcard.
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed.is_empty() {
        tracing::info!("no CORS origins configured, defaulting to localhost:3000");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
            .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "sessions": state.registry.len(),
    }))
}

/// Aggregate latency/cost summary across sessions
async fn get_metrics(State(state): State<AppState>) -> Json<AggregateMetrics> {
    Json(state.registry.aggregate())
}

/// Per-session latency/cost history
async fn get_session_metrics(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMetrics>, StatusCode> {
    state
        .registry
        .session_metrics(&session_id)
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

/// List active session ids
async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.ids();
    Json(serde_json::json!({
        "sessions": sessions,
        "count": sessions.len(),
    }))
}

/// Terminate a session
async fn terminate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    match state.registry.terminate(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}
