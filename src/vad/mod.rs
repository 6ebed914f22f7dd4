//! Voice-activity gating
//!
//! Classifies every captured frame as speech or silence and derives the
//! utterance boundaries the session controller uses for turn-taking.

mod gate;

pub use gate::{GateConfig, VoiceActivityGate, VoiceEvent};
