//! Voice session management
//!
//! This module provides the `SessionController` that supervises:
//! - Audio capture and voice-activity gating
//! - The transport to the realtime model, including reconnects
//! - Turn assembly and best-effort persistence
//! - Session state and statistics for the presentation layer

mod config;
mod controller;
mod state;
mod stats;

pub use config::{SessionConfig, Voice};
pub use controller::{Collaborators, SessionController};
pub use state::{ActiveState, SessionFailure, SessionState};
pub use stats::SessionStats;
