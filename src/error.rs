//! Error types for realtime voice sessions.
//!
//! Each pipeline stage has its own error enum. Fatal conditions are reduced
//! to a [`ReasonCode`] before they reach the presentation layer, which never
//! sees raw transport errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Audio capture failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio input device lost: {0}")]
    DeviceLost(String),
}

/// Failures of the bidirectional stream to the remote model
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Session was not confirmed within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("Outbound audio queue overrun ({dropped} oldest frames dropped)")]
    Overrun { dropped: usize },

    #[error("Transport dropped: {0}")]
    Dropped(String),

    #[error("Transport is closed")]
    Closed,
}

/// Inbound messages the client could not make sense of.
///
/// Always logged and discarded; never ends a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Unrecognized event type: {0}")]
    Unrecognized(String),

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),
}

/// Conversation store failures (non-fatal for the session)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Failed to encode turn: {0}")]
    Encode(String),

    #[error("Failed to decode turn: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Credential unavailable for scope {scope}: {message}")]
    Unavailable { scope: String, message: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid session configuration: {0}")]
    Invalid(String),
}

/// Machine-readable cause of a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    DeviceUnavailable,
    DeviceLost,
    ConnectError,
    ConfirmTimeout,
    TransportDropped,
    Internal,
}

impl From<&CaptureError> for ReasonCode {
    fn from(err: &CaptureError) -> Self {
        match err {
            CaptureError::DeviceUnavailable(_) => ReasonCode::DeviceUnavailable,
            CaptureError::DeviceLost(_) => ReasonCode::DeviceLost,
        }
    }
}

impl From<&TransportError> for ReasonCode {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::Connect(_) => ReasonCode::ConnectError,
            TransportError::ConfirmTimeout(_) => ReasonCode::ConfirmTimeout,
            TransportError::Dropped(_) | TransportError::Closed => ReasonCode::TransportDropped,
            TransportError::Overrun { .. } => ReasonCode::Internal,
        }
    }
}

/// Errors returned by the session controller API
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("Operation not allowed in state {0}")]
    InvalidState(String),

    #[error("Session was stopped")]
    Stopped,
}

impl SessionError {
    /// Reason recorded when this error terminates a session
    pub fn reason(&self) -> ReasonCode {
        match self {
            SessionError::Capture(e) => e.into(),
            SessionError::Transport(e) => e.into(),
            SessionError::Credential(_) => ReasonCode::ConnectError,
            SessionError::Config(_) | SessionError::InvalidState(_) | SessionError::Stopped => {
                ReasonCode::Internal
            }
        }
    }
}
