use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ReasonCode;

/// Sub-state of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    /// Waiting for or accumulating user speech
    Listening,
    /// User turn flushed; model output expected
    Responding,
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub reason: ReasonCode,
    pub message: String,
}

/// Lifecycle of a session as seen by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active { phase: ActiveState },
    Reconnecting { attempt: usize },
    Closing,
    Closed,
    Failed(SessionFailure),
}

impl SessionState {
    pub const LISTENING: SessionState = SessionState::Active {
        phase: ActiveState::Listening,
    };
    pub const RESPONDING: SessionState = SessionState::Active {
        phase: ActiveState::Responding,
    };

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }

        match (self, next) {
            (Idle, Connecting) | (Idle, Closed) => true,
            (Connecting, Active { phase: ActiveState::Listening }) | (Connecting, Closing) => true,
            (Active { .. }, Active { .. }) => true,
            (Active { .. }, Reconnecting { .. }) | (Active { .. }, Closing) => true,
            (Reconnecting { .. }, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Active { phase: ActiveState::Listening }) => true,
            (Reconnecting { .. }, Connecting) | (Reconnecting { .. }, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Active { phase: ActiveState::Listening } => write!(f, "active.listening"),
            SessionState::Active { phase: ActiveState::Responding } => write!(f, "active.responding"),
            SessionState::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed(failure) => write!(f, "failed({:?})", failure.reason),
        }
    }
}

/// Shared, observable session state that only moves along allowed edges
#[derive(Clone)]
pub(crate) struct StateCell {
    session_id: String,
    tx: Arc<watch::Sender<SessionState>>,
    ended_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl StateCell {
    pub(crate) fn new(session_id: &str) -> Self {
        let (tx, _) = watch::channel(SessionState::Idle);
        Self {
            session_id: session_id.to_string(),
            tx: Arc::new(tx),
            ended_at: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// When a terminal state was entered
    pub(crate) fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`; returns false (and changes nothing) when the edge is not allowed
    pub(crate) fn set(&self, next: SessionState) -> bool {
        let mut from = None;
        let mut rejected = false;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                rejected = true;
                from = Some(current.clone());
                return false;
            }
            if next.is_terminal() {
                *self.ended_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
            }
            from = Some(std::mem::replace(current, next.clone()));
            true
        });

        match from {
            Some(from) if rejected => {
                warn!(
                    "Session {}: ignoring transition {} -> {}",
                    self.session_id, from, next
                );
                false
            }
            Some(from) => {
                info!("Session {}: {} -> {}", self.session_id, from, next);
                true
            }
            None => false,
        }
    }
}
