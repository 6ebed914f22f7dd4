use std::collections::VecDeque;
use tracing::debug;

use crate::audio::AudioFrame;

/// dBFS mapped to zero confidence
const FLOOR_DBFS: f32 = -60.0;
/// dBFS mapped to full confidence
const CEILING_DBFS: f32 = -20.0;

/// Per-frame classification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEvent {
    /// First voiced frame of an utterance
    SpeechStarted,
    /// Frame inside an utterance (voiced, or a pause shorter than the silence threshold)
    Speaking,
    /// Trailing silence reached the threshold; the utterance is over
    SpeechStopped { duration_ms: u64 },
    /// No utterance in progress
    Silence,
}

/// Configuration for the voice-activity gate
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Sensitivity threshold on the smoothed confidence (0.0 - 1.0)
    pub threshold: f32,
    /// Trailing silence before an utterance ends (200 - 2000 ms)
    pub silence_duration_ms: u64,
    /// Length of the smoothing window
    pub window_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            silence_duration_ms: 500,
            window_ms: 60,
        }
    }
}

/// Energy-based voice-activity gate
///
/// Keeps a trailing window of per-frame confidences and derives utterance
/// boundaries from it. Between two `SpeechStopped` events at most one
/// `SpeechStarted` is ever emitted.
#[derive(Debug)]
pub struct VoiceActivityGate {
    config: GateConfig,
    window: VecDeque<(f32, u64)>,
    window_total_ms: u64,
    in_speech: bool,
    speech_ms: u64,
    trailing_silence_ms: u64,
}

impl VoiceActivityGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            window_total_ms: 0,
            in_speech: false,
            speech_ms: 0,
            trailing_silence_ms: 0,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Whether an utterance is in progress
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Map a frame's RMS energy onto 0..1
    pub fn frame_confidence(frame: &AudioFrame) -> f32 {
        let rms = frame.rms();
        if rms <= 0.0 {
            return 0.0;
        }
        let dbfs = 20.0 * (rms / 32768.0).log10();
        ((dbfs - FLOOR_DBFS) / (CEILING_DBFS - FLOOR_DBFS)).clamp(0.0, 1.0)
    }

    /// Smoothed confidence over the trailing window
    pub fn confidence(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.window.iter().map(|(c, _)| c).sum();
        sum / self.window.len() as f32
    }

    pub fn classify(&mut self, frame: &AudioFrame) -> VoiceEvent {
        let frame_ms = frame.duration_ms().max(1);
        self.observe(Self::frame_confidence(frame), frame_ms);

        let voiced = self.confidence() >= self.config.threshold;

        if !self.in_speech {
            if voiced {
                self.in_speech = true;
                self.speech_ms = frame_ms;
                self.trailing_silence_ms = 0;
                debug!("Speech started at {}ms", frame.timestamp_ms);
                return VoiceEvent::SpeechStarted;
            }
            return VoiceEvent::Silence;
        }

        if voiced {
            self.speech_ms += self.trailing_silence_ms + frame_ms;
            self.trailing_silence_ms = 0;
            return VoiceEvent::Speaking;
        }

        self.trailing_silence_ms += frame_ms;
        if self.trailing_silence_ms >= self.config.silence_duration_ms {
            let duration_ms = self.speech_ms;
            debug!(
                "Speech stopped at {}ms after {}ms of speech",
                frame.timestamp_ms, duration_ms
            );
            self.end_utterance();
            return VoiceEvent::SpeechStopped { duration_ms };
        }

        VoiceEvent::Speaking
    }

    /// Forced boundary: drop any utterance in progress and the smoothing history
    pub fn reset(&mut self) {
        self.end_utterance();
        self.window.clear();
        self.window_total_ms = 0;
    }

    fn end_utterance(&mut self) {
        self.in_speech = false;
        self.speech_ms = 0;
        self.trailing_silence_ms = 0;
    }

    fn observe(&mut self, confidence: f32, frame_ms: u64) {
        self.window.push_back((confidence, frame_ms));
        self.window_total_ms += frame_ms;

        while self.window.len() > 1 && self.window_total_ms > self.config.window_ms {
            if let Some((_, ms)) = self.window.pop_front() {
                self.window_total_ms -= ms;
            }
        }
    }
}
