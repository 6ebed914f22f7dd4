use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::audio::AudioFrame;
use crate::error::ProtocolError;
use crate::session::Voice;
use crate::turn::Role;

// ============================================================================
// Outbound
// ============================================================================

/// Control and audio messages sent to the realtime model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionParams },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend {
        /// Base64-encoded little-endian PCM16
        audio: String,
    },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn audio(frame: &AudioFrame) -> Self {
        ClientEvent::InputAudioAppend {
            audio: base64::engine::general_purpose::STANDARD.encode(frame.to_pcm_bytes()),
        }
    }

    /// Wire name of the message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

/// Negotiated session configuration carried by `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    pub modalities: Vec<String>,
    pub voice: Voice,
    pub instructions: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionParams>,
    pub turn_detection: Option<TurnDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u64,
        silence_duration_ms: u64,
    },
}

// ============================================================================
// Inbound
// ============================================================================

/// Inbound events, after decoding, in receipt order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `session.created` / `session.updated`
    SessionConfirmed,
    TranscriptDelta { role: Role, text: String },
    TranscriptFinal { role: Role, text: String },
    /// Decoded PCM16 bytes of assistant speech
    AudioDelta { bytes: Vec<u8> },
    AudioDone,
    /// Server-side VAD saw the user start speaking
    SpeechStarted,
    /// Server-side VAD saw the user stop speaking
    SpeechStopped,
    Error { code: String, message: String },
    /// The in-flight response was cancelled
    Interrupted,
}

/// Informational events that carry nothing the client acts on
const IGNORED_EVENTS: &[&str] = &[
    "conversation.created",
    "conversation.item.created",
    "conversation.item.deleted",
    "conversation.item.truncated",
    "input_audio_buffer.committed",
    "input_audio_buffer.cleared",
    "rate_limits.updated",
    "response.created",
    "response.output_item.added",
    "response.output_item.done",
    "response.content_part.added",
    "response.content_part.done",
    "response.text.delta",
    "response.text.done",
];

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: String,
}

impl ErrorBody {
    fn code(&self) -> String {
        self.code
            .clone()
            .or_else(|| self.kind.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseBody {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputTranscriptFailed { error: ErrorBody },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio.done")]
    AudioDone {},
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone { transcript: String },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseBody,
    },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text message
///
/// Returns `Ok(None)` for informational events the client does not act on.
pub fn decode_event(text: &str) -> Result<Option<StreamEvent>, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?
        .to_string();

    if IGNORED_EVENTS.contains(&kind.as_str()) {
        trace!("Ignoring informational event {}", kind);
        return Ok(None);
    }

    let event: ServerEvent = serde_json::from_value(value)
        .map_err(|e| ProtocolError::Malformed(format!("{}: {}", kind, e)))?;

    let decoded = match event {
        ServerEvent::SessionCreated {} | ServerEvent::SessionUpdated {} => {
            StreamEvent::SessionConfirmed
        }
        ServerEvent::InputTranscriptDelta { delta } => StreamEvent::TranscriptDelta {
            role: Role::User,
            text: delta,
        },
        ServerEvent::InputTranscriptCompleted { transcript } => StreamEvent::TranscriptFinal {
            role: Role::User,
            text: transcript,
        },
        ServerEvent::InputTranscriptFailed { error } => {
            warn!("Input transcription failed: {}", error.message);
            StreamEvent::TranscriptFinal {
                role: Role::User,
                text: String::new(),
            }
        }
        ServerEvent::AudioDelta { delta } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(delta.as_bytes())
                .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))?;
            StreamEvent::AudioDelta { bytes }
        }
        ServerEvent::AudioDone {} => StreamEvent::AudioDone,
        ServerEvent::TranscriptDelta { delta } => StreamEvent::TranscriptDelta {
            role: Role::Assistant,
            text: delta,
        },
        ServerEvent::TranscriptDone { transcript } => StreamEvent::TranscriptFinal {
            role: Role::Assistant,
            text: transcript,
        },
        ServerEvent::SpeechStarted {} => StreamEvent::SpeechStarted,
        ServerEvent::SpeechStopped {} => StreamEvent::SpeechStopped,
        ServerEvent::ResponseDone { response } => match response.status.as_deref() {
            Some("cancelled") => StreamEvent::Interrupted,
            _ => return Ok(None),
        },
        ServerEvent::Error { error } => StreamEvent::Error {
            code: error.code(),
            message: error.message,
        },
        ServerEvent::Unknown => return Err(ProtocolError::Unrecognized(kind)),
    };

    Ok(Some(decoded))
}
