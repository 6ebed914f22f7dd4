//! HTTP API for a presentation layer
//!
//! This module provides a REST API for controlling voice sessions:
//! - POST /sessions - Start a new session
//! - POST /sessions/:id/stop - Stop a session
//! - GET /sessions/:id/status - Query state, last error and statistics
//! - GET /sessions/:id/transcript - Get the conversation so far
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, CaptureFactory, DeviceCaptureFactory};
