pub mod backend;
pub mod channel;
pub mod file;
pub mod framer;
pub mod resample;

#[cfg(feature = "microphone")]
pub mod microphone;

pub use backend::{AudioCapture, AudioFrame, CaptureConfig, CaptureStream, DEFAULT_SAMPLE_RATE};
pub use channel::{ChannelCapture, FrameSink};
pub use file::{AudioFile, WavCapture};
pub use framer::Framer;
pub use resample::{downmix, resample, Resampler};

#[cfg(feature = "microphone")]
pub use microphone::MicrophoneCapture;
