use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::audio::{CaptureConfig, DEFAULT_SAMPLE_RATE};
use crate::error::ConfigError;
use crate::transport::{ReconnectPolicy, SessionParams, TranscriptionParams, TransportConfig, TurnDetection};
use crate::turn::PersistConfig;
use crate::vad::GateConfig;

/// Named voices offered by the realtime model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl Voice {
    pub const ALL: [Voice; 8] = [
        Voice::Alloy,
        Voice::Ash,
        Voice::Ballad,
        Voice::Coral,
        Voice::Echo,
        Voice::Sage,
        Voice::Shimmer,
        Voice::Verse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Alloy => "alloy",
            Voice::Ash => "ash",
            Voice::Ballad => "ballad",
            Voice::Coral => "coral",
            Voice::Echo => "echo",
            Voice::Sage => "sage",
            Voice::Shimmer => "shimmer",
            Voice::Verse => "verse",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Voice::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown voice {:?}", s)))
    }
}

/// Configuration for a realtime voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unique session identifier, also the conversation store key
    pub session_id: String,

    pub voice: Voice,

    /// Free-text system instructions for the model
    pub instructions: String,

    /// VAD sensitivity (0.0 - 1.0), used locally and sent to the server
    pub vad_threshold: f32,

    /// Trailing silence that ends a user turn (200 - 2000 ms)
    pub silence_duration_ms: u64,

    /// Wire sample rate for PCM16 audio in both directions
    pub sample_rate: u32,

    pub frame_duration_ms: u64,

    /// Outbound audio queue bound, in frames
    pub queue_depth: usize,

    /// Upper bound on establishing the stream, before negotiation
    pub connect_timeout_ms: u64,

    pub confirm_timeout_ms: u64,

    /// Whether user speech may cut off the assistant
    pub allow_interruption: bool,

    /// Model used to transcribe user audio; `None` disables transcription
    pub transcription_model: Option<String>,

    /// Scope passed to the credential provider
    pub token_scope: String,

    pub reconnect: ReconnectPolicy,

    pub persist: PersistConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("session-{}", uuid::Uuid::new_v4()),
            voice: Voice::default(),
            instructions: String::new(),
            vad_threshold: 0.5,
            silence_duration_ms: 500,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: 20,
            queue_depth: 50,
            connect_timeout_ms: 10_000,
            confirm_timeout_ms: 10_000,
            allow_interruption: true,
            transcription_model: None,
            token_scope: "realtime".to_string(),
            reconnect: ReconnectPolicy::default(),
            persist: PersistConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.trim().is_empty() {
            return Err(ConfigError::Invalid("session id is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(ConfigError::Invalid(format!(
                "VAD threshold {} outside 0.0 - 1.0",
                self.vad_threshold
            )));
        }
        if !(200..=2000).contains(&self.silence_duration_ms) {
            return Err(ConfigError::Invalid(format!(
                "silence duration {} ms outside 200 - 2000 ms",
                self.silence_duration_ms
            )));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample rate is zero".into()));
        }
        if self.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid("frame duration is zero".into()));
        }
        if self.connect_timeout_ms == 0 || self.confirm_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect and confirm timeouts must be non-zero".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue depth is zero".into()));
        }
        Ok(())
    }

    pub fn transcription_enabled(&self) -> bool {
        self.transcription_model.is_some()
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Parameters negotiated with the model on every (re)connect
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: self.voice,
            instructions: self.instructions.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: self
                .transcription_model
                .clone()
                .map(|model| TranscriptionParams { model }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: self.vad_threshold,
                prefix_padding_ms: 300,
                silence_duration_ms: self.silence_duration_ms,
            }),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            params: self.session_params(),
            queue_depth: self.queue_depth,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            confirm_timeout: self.confirm_timeout(),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            threshold: self.vad_threshold,
            silence_duration_ms: self.silence_duration_ms,
            ..GateConfig::default()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.sample_rate,
            frame_duration_ms: self.frame_duration_ms,
            ..CaptureConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.session_id.starts_with("session-"));
        assert!(!config.transcription_enabled());
    }

    #[test]
    fn test_silence_duration_bounds() {
        for (ms, ok) in [(199, false), (200, true), (2000, true), (2001, false)] {
            let config = SessionConfig {
                silence_duration_ms: ms,
                ..SessionConfig::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "silence {} ms", ms);
        }
    }

    #[test]
    fn test_rejects_bad_threshold_and_sizes() {
        let bad = [
            SessionConfig {
                vad_threshold: 1.5,
                ..SessionConfig::default()
            },
            SessionConfig {
                queue_depth: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                frame_duration_ms: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                sample_rate: 0,
                ..SessionConfig::default()
            },
            SessionConfig {
                connect_timeout_ms: 0,
                ..SessionConfig::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_voice_parsing() {
        assert_eq!("Shimmer".parse::<Voice>().unwrap(), Voice::Shimmer);
        assert!("robot".parse::<Voice>().is_err());
        assert_eq!(Voice::Verse.to_string(), "verse");
    }

    #[test]
    fn test_session_params_carry_turn_detection() {
        let config = SessionConfig {
            voice: Voice::Shimmer,
            silence_duration_ms: 700,
            transcription_model: Some("whisper-1".into()),
            ..SessionConfig::default()
        };
        let json = serde_json::to_value(config.session_params()).unwrap();

        assert_eq!(json["voice"], "shimmer");
        assert_eq!(json["turn_detection"]["type"], "server_vad");
        assert_eq!(json["turn_detection"]["silence_duration_ms"], 700);
        assert_eq!(json["input_audio_transcription"]["model"], "whisper-1");
    }
}
