use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Router for the session control surface
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Lifecycle
        .route("/sessions", post(handlers::start_session))
        .route("/sessions/:session_id/stop", post(handlers::stop_session))
        // Read-only views; stopped sessions stay queryable
        .route("/sessions/:session_id/status", get(handlers::get_session_status))
        .route(
            "/sessions/:session_id/transcript",
            get(handlers::get_session_transcript),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
