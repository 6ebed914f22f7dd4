// Push-based capture for hosts that own the input device themselves

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{AudioCapture, AudioFrame, CaptureConfig, CaptureStream};
use super::framer::Framer;
use crate::error::CaptureError;

type FrameSender = mpsc::Sender<Result<AudioFrame, CaptureError>>;

struct Shared {
    tx: Mutex<Option<FrameSender>>,
    framer: Mutex<Framer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Capture whose samples are supplied through a [`FrameSink`]
pub struct ChannelCapture {
    config: CaptureConfig,
    shared: Arc<Shared>,
}

/// Producer half of a [`ChannelCapture`]
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<Shared>,
}

impl ChannelCapture {
    pub fn new(config: CaptureConfig) -> (Self, FrameSink) {
        let shared = Arc::new(Shared {
            tx: Mutex::new(None),
            framer: Mutex::new(Framer::new(config.sample_rate, config.samples_per_frame())),
        });

        let sink = FrameSink {
            shared: Arc::clone(&shared),
        };

        (Self { config, shared }, sink)
    }
}

#[async_trait::async_trait]
impl AudioCapture for ChannelCapture {
    async fn start(&mut self) -> Result<CaptureStream, CaptureError> {
        let mut slot = lock(&self.shared.tx);
        if slot.is_some() {
            return Err(CaptureError::DeviceUnavailable("Already capturing".to_string()));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        lock(&self.shared.framer).reset();
        *slot = Some(tx);

        info!("Channel capture started ({}Hz)", self.config.sample_rate);
        Ok(rx)
    }

    async fn stop(&mut self) {
        if lock(&self.shared.tx).take().is_some() {
            info!("Channel capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        lock(&self.shared.tx).is_some()
    }

    fn name(&self) -> &str {
        "channel"
    }
}

impl FrameSink {
    /// Frame `samples` and wait for room in the capture stream
    ///
    /// Returns the number of frames delivered (0 when capture is not running).
    pub async fn send(&self, samples: &[i16]) -> usize {
        let Some(tx) = lock(&self.shared.tx).clone() else {
            return 0;
        };

        let frames = lock(&self.shared.framer).push(samples);
        let mut delivered = 0;
        for frame in frames {
            if tx.send(Ok(frame)).await.is_err() {
                break;
            }
            delivered += 1;
        }
        delivered
    }

    /// Frame `samples` without waiting; frames that do not fit are dropped
    pub fn push(&self, samples: &[i16]) -> usize {
        let Some(tx) = lock(&self.shared.tx).clone() else {
            return 0;
        };

        let frames = lock(&self.shared.framer).push(samples);
        let mut delivered = 0;
        for frame in frames {
            match tx.try_send(Ok(frame)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Capture consumer is behind, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        delivered
    }

    /// Report that the device went away; the capture stream ends
    pub async fn fail(&self, reason: impl Into<String>) {
        let tx = lock(&self.shared.tx).take();
        if let Some(tx) = tx {
            let reason = reason.into();
            warn!("Capture device lost: {}", reason);
            let _ = tx.send(Err(CaptureError::DeviceLost(reason))).await;
        }
    }

    /// Whether the paired capture is currently running
    pub fn is_active(&self) -> bool {
        lock(&self.shared.tx).is_some()
    }
}
