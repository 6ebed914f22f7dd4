use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::state::{SessionFailure, SessionState};

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,

    pub state: SessionState,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// Total duration in seconds
    pub duration_secs: f64,

    /// Frames delivered by the capture device
    pub frames_captured: u64,

    /// Frames handed to the transport
    pub frames_sent: u64,

    /// Frames evicted from the outbound queue on overrun
    pub frames_overrun: u64,

    /// Frames discarded while reconnecting
    pub frames_dropped: u64,

    /// Inbound events processed
    pub events_received: u64,

    pub user_turns: u64,

    pub assistant_turns: u64,

    /// Assistant turns cut short by the user
    pub interruptions: u64,

    pub reconnects: u64,

    /// Turns not yet confirmed by the store
    pub persist_pending: usize,

    /// Failed store attempts (each is retried)
    pub persist_failures: u64,

    pub last_error: Option<SessionFailure>,
}

/// Live counters updated by the session task
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_captured: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_overrun: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub events_received: AtomicU64,
    pub user_turns: AtomicU64,
    pub assistant_turns: AtomicU64,
    pub interruptions: AtomicU64,
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
