use anyhow::{Context, Result};
use hound::WavReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::backend::{AudioCapture, CaptureConfig, CaptureStream};
use super::framer::Framer;
use super::resample::{downmix, resample};
use crate::error::CaptureError;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            anyhow::bail!(
                "Unsupported WAV format: {}-bit {:?} (expected 16-bit PCM)",
                spec.bits_per_sample,
                spec.sample_format
            );
        }

        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Convert to mono at the given rate (the wire format)
    pub fn to_mono(&self, target_rate: u32) -> Vec<i16> {
        let mono = downmix(&self.samples, self.channels);
        resample(&mono, self.sample_rate, target_rate)
    }
}

/// Replays a WAV file as if it were a live microphone
///
/// Frames are emitted at real-time pace. Once the file is exhausted the
/// capture keeps producing silence until stopped, so a trailing utterance
/// still reaches its end-of-turn.
pub struct WavCapture {
    path: PathBuf,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl WavCapture {
    pub fn new(path: impl Into<PathBuf>, config: CaptureConfig) -> Self {
        Self {
            path: path.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioCapture for WavCapture {
    async fn start(&mut self) -> Result<CaptureStream, CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable("Already capturing".to_string()));
        }

        let path = self.path.clone();
        let target_rate = self.config.sample_rate;
        let samples = tokio::task::spawn_blocking(move || {
            AudioFile::open(&path).map(|audio| audio.to_mono(target_rate))
        })
        .await
        .map_err(|e| CaptureError::DeviceUnavailable(format!("WAV loader panicked: {}", e)))?
        .map_err(|e| CaptureError::DeviceUnavailable(format!("{:#}", e)))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let running = Arc::clone(&self.running);
        let frame_duration = Duration::from_millis(self.config.frame_duration_ms);
        let mut framer = Framer::new(target_rate, self.config.samples_per_frame());
        let silence = vec![0i16; self.config.samples_per_frame()];

        running.store(true, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let mut frames = framer.push(&samples).into_iter();
            let mut tail = framer.flush();
            let mut ticker = tokio::time::interval(frame_duration);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;

                let frame = match frames.next().or_else(|| tail.take()) {
                    Some(frame) => frame,
                    None => match framer.push(&silence).pop() {
                        Some(frame) => frame,
                        None => continue,
                    },
                };

                match tx.try_send(Ok(frame)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Capture consumer is behind, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }

            debug!("WAV capture loop exited");
        });

        self.task = Some(task);
        info!("WAV capture started: {}", self.path.display());

        Ok(rx)
    }

    async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        info!("WAV capture stopped: {}", self.path.display());
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "WAV file"
    }
}
