use crate::error::CaptureError;
use tokio::sync::mpsc;

/// Default wire sample rate for the realtime model (24kHz mono PCM16)
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// One fixed-duration buffer of captured audio (16-bit PCM, mono)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, mono)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Monotonic frame counter within one capture run
    pub sequence: u64,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Little-endian PCM bytes as sent on the wire
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Root-mean-square amplitude in sample units (0..=32768)
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64;
                v * v
            })
            .sum();
        (sum / self.samples.len() as f64).sqrt() as f32
    }
}

/// Configuration for audio capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Output sample rate (input is resampled if needed)
    pub sample_rate: u32,
    /// Frame size in milliseconds (affects latency)
    pub frame_duration_ms: u64,
    /// Frames buffered between the device and the consumer before dropping
    pub channel_capacity: usize,
}

impl CaptureConfig {
    /// Samples in one frame at the configured rate
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms / 1000) as usize
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: 20,
            channel_capacity: 50,
        }
    }
}

/// Frames (or an in-stream capture failure) delivered by a running capture
pub type CaptureStream = mpsc::Receiver<Result<AudioFrame, CaptureError>>;

/// Audio capture source
///
/// Implementations:
/// - `ChannelCapture`: frames pushed by an embedding host (or tests)
/// - `WavCapture`: replays a WAV file in real time
/// - `MicrophoneCapture`: default input device via cpal (feature `microphone`)
#[async_trait::async_trait]
pub trait AudioCapture: Send {
    /// Start capturing audio
    ///
    /// Returns a receiver of frames at a constant nominal rate. The stream
    /// ends after `stop()`; an `Err` item or an early end means the device
    /// was lost.
    async fn start(&mut self) -> Result<CaptureStream, CaptureError>;

    /// Stop capturing audio (no-op when not capturing)
    async fn stop(&mut self);

    /// Check if capture is currently running
    fn is_capturing(&self) -> bool;

    /// Get capture name for logging
    fn name(&self) -> &str;
}
