use super::state::{prune_finished, AppState};
use crate::session::{SessionState, SessionStats, Voice};
use crate::turn::Turn;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    /// Optional session ID (if not provided, generate UUID)
    pub session_id: Option<String>,

    pub voice: Option<Voice>,

    pub instructions: Option<String>,

    /// Trailing silence that ends a user turn, in milliseconds
    pub silence_duration_ms: Option<u64>,

    /// Replay this WAV file instead of a live device
    pub wav_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub state: SessionState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub session_id: String,
    pub message: String,
    pub stats: SessionStats,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn not_found(session_id: &str) -> axum::response::Response {
    error_response(StatusCode::NOT_FOUND, format!("Session {} not found", session_id))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Create a session and start connecting in the background
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let mut config = state.defaults.clone();
    config.session_id = req
        .session_id
        .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
    if let Some(voice) = req.voice {
        config.voice = voice;
    }
    if let Some(instructions) = req.instructions {
        config.instructions = instructions;
    }
    if let Some(silence) = req.silence_duration_ms {
        config.silence_duration_ms = silence;
    }
    let session_id = config.session_id.clone();

    info!("Starting session: {}", session_id);

    // Check and insert under one guard so two requests for the same id
    // cannot both get through
    let session = {
        let mut sessions = state.sessions.write().await;
        prune_finished(&mut sessions, state.retention);

        // A finished session with the same id may be replaced; a live one may not
        if let Some(existing) = sessions.get(&session_id) {
            if !existing.state().is_terminal() {
                return error_response(
                    StatusCode::CONFLICT,
                    format!("Session {} is already running", session_id),
                );
            }
        }

        let session = match state.build_session(config, req.wav_path.as_deref()) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("Rejected session {}: {:#}", session_id, e);
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to create session: {:#}", e),
                );
            }
        };
        sessions.insert(session_id.clone(), Arc::clone(&session));
        session
    };

    // Connecting may take up to the confirm timeout; callers poll status
    let starting = Arc::clone(&session);
    tokio::spawn(async move {
        if let Err(e) = starting.start().await {
            error!("Session {} failed to start: {}", starting.session_id(), e);
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(StartSessionResponse {
            session_id: session_id.clone(),
            state: session.state(),
            message: format!("Session {} is connecting", session_id),
        }),
    )
        .into_response()
}

/// POST /sessions/:session_id/stop
/// Stop a session; it stays queryable afterwards
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    info!("Stopping session: {}", session_id);

    let session = {
        let sessions = state.sessions.read().await;
        sessions.get(&session_id).cloned()
    };

    let Some(session) = session else {
        return not_found(&session_id);
    };

    match session.stop().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StopSessionResponse {
                session_id: session_id.clone(),
                message: format!("Session {}", stats.state),
                stats,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop session: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stop session: {}", e),
            )
        }
    }
}

/// GET /sessions/:session_id/status
/// State, last error and statistics
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let sessions = state.sessions.read().await;

    match sessions.get(&session_id) {
        Some(session) => (StatusCode::OK, Json(session.stats())).into_response(),
        None => not_found(&session_id),
    }
}

/// GET /sessions/:session_id/transcript
/// Stored history plus the turns finalized so far
pub async fn get_session_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let session = {
        let sessions = state.sessions.read().await;
        sessions.get(&session_id).cloned()
    };

    match session {
        Some(session) => {
            let transcript: Vec<Turn> = session.transcript().await;
            (StatusCode::OK, Json(transcript)).into_response()
        }
        None => not_found(&session_id),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
