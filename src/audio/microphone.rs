// Default input device capture via cpal
//
// cpal streams are not Send, so the stream lives on a dedicated thread for
// the lifetime of the capture. The thread exits (and releases the device)
// when the stop channel fires or its sender is dropped.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::backend::{AudioCapture, AudioFrame, CaptureConfig, CaptureStream};
use super::framer::Framer;
use super::resample::{downmix, Resampler};
use crate::error::CaptureError;

type FrameSender = mpsc::Sender<Result<AudioFrame, CaptureError>>;

pub struct MicrophoneCapture {
    config: CaptureConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_tx: None,
            thread: None,
        }
    }
}

/// Converts device buffers into wire-format frames inside the cpal callback
struct Pipeline {
    channels: u16,
    resampler: Resampler,
    framer: Framer,
    tx: FrameSender,
}

impl Pipeline {
    fn process(&mut self, interleaved: &[i16]) {
        let mono = downmix(interleaved, self.channels);
        let resampled = self.resampler.process(&mono);
        for frame in self.framer.push(&resampled) {
            if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(Ok(frame)) {
                debug!("Capture consumer is behind, dropping frame");
            }
        }
    }
}

fn build_stream(
    config: &CaptureConfig,
    tx: FrameSender,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("No default input device".to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();

    info!(
        "Opening input device {} ({}Hz, {} channels, {:?})",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        stream_config.sample_rate.0,
        stream_config.channels,
        sample_format
    );

    let mut pipeline = Pipeline {
        channels: stream_config.channels,
        resampler: Resampler::new(stream_config.sample_rate.0, config.sample_rate),
        framer: Framer::new(config.sample_rate, config.samples_per_frame()),
        tx: tx.clone(),
    };

    let err_tx = tx;
    let on_error = move |err: cpal::StreamError| {
        error!("Input stream error: {}", err);
        let _ = err_tx.try_send(Err(CaptureError::DeviceLost(err.to_string())));
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| pipeline.process(data),
            on_error,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                pipeline.process(&samples)
            },
            on_error,
            None,
        ),
        other => {
            return Err(CaptureError::DeviceUnavailable(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}

#[async_trait::async_trait]
impl AudioCapture for MicrophoneCapture {
    async fn start(&mut self) -> Result<CaptureStream, CaptureError> {
        if self.stop_tx.is_some() {
            return Err(CaptureError::DeviceUnavailable("Already capturing".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        let thread = std::thread::spawn(move || {
            let stream = match build_stream(&config, tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Blocks until stop() sends or drops the sender
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Input stream released");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(CaptureError::DeviceUnavailable(
                    "Capture thread exited during startup".to_string(),
                ))
            }
        }

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        info!("Microphone capture started");

        Ok(rx)
    }

    async fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());

        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }

        info!("Microphone capture stopped");
    }

    fn is_capturing(&self) -> bool {
        self.stop_tx.is_some()
    }

    fn name(&self) -> &str {
        "microphone"
    }
}
