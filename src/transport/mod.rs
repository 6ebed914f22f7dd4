//! Bidirectional stream to the remote speech model
//!
//! This module provides the `TransportSession` abstraction that manages:
//! - Connecting and negotiating the session configuration
//! - Bounded, oldest-drop outbound audio
//! - Control messages (cancel, reconfigure)
//! - Decoding inbound events into typed `StreamEvent`s
//! - The reconnect backoff schedule

mod client;
mod connection;
mod messages;
mod policy;
mod queue;

pub use client::{TransportConfig, TransportSession};
pub use connection::{AuthHeader, Connection, Connector, WebSocketConnector};
pub use messages::{
    decode_event, ClientEvent, SessionParams, StreamEvent, TranscriptionParams, TurnDetection,
};
pub use policy::ReconnectPolicy;
pub use queue::AudioQueue;
