use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{Connection, Connector};
use super::messages::{decode_event, ClientEvent, SessionParams, StreamEvent};
use super::queue::AudioQueue;
use crate::audio::AudioFrame;
use crate::error::TransportError;
use crate::store::AccessToken;

/// Settings for one transport session
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Sent as `session.update` right after connecting
    pub params: SessionParams,
    /// Outbound audio queue bound, in frames
    pub queue_depth: usize,
    /// How long the connector may take to establish the stream
    pub connect_timeout: Duration,
    /// How long to wait for the session to be confirmed
    pub confirm_timeout: Duration,
}

/// The single live stream between a session and the remote model
///
/// All socket I/O happens on one background task that owns the connection.
/// Dropping the session aborts that task, so the connection is released on
/// every exit path.
pub struct TransportSession {
    outbound: Arc<AudioQueue>,
    control_tx: mpsc::Sender<ClientEvent>,
    events_rx: Option<mpsc::Receiver<StreamEvent>>,
    shutdown: Arc<Notify>,
    alive: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<TransportError>>>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Connect, send the session configuration and wait for confirmation
    pub async fn open(
        connector: &dyn Connector,
        token: &AccessToken,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let connection = tokio::time::timeout(config.connect_timeout, connector.connect(token))
            .await
            .map_err(|_| {
                TransportError::Connect(format!("timed out after {:?}", config.connect_timeout))
            })??;
        let mut session = Self::spawn(connection, config.queue_depth);

        match session.negotiate(config).await {
            Ok(()) => {
                info!("Realtime session confirmed (voice: {:?})", config.params.voice);
                Ok(session)
            }
            Err(e) => {
                warn!("Realtime session negotiation failed: {}", e);
                session.close().await;
                Err(e)
            }
        }
    }

    fn spawn(connection: Box<dyn Connection>, queue_depth: usize) -> Self {
        let outbound = Arc::new(AudioQueue::new(queue_depth));
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(256);
        let shutdown = Arc::new(Notify::new());
        let alive = Arc::new(AtomicBool::new(true));
        let close_reason = Arc::new(Mutex::new(None));

        let mut io = IoTask {
            connection,
            outbound: Arc::clone(&outbound),
            control_rx,
            events_tx,
            shutdown: Arc::clone(&shutdown),
        };
        let task = {
            let alive = Arc::clone(&alive);
            let close_reason = Arc::clone(&close_reason);
            tokio::spawn(async move {
                let reason = io.run().await;
                alive.store(false, Ordering::SeqCst);
                if let Some(reason) = reason {
                    warn!("Transport closed: {}", reason);
                    *close_reason.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
                } else {
                    debug!("Transport closed locally");
                }
                // Consumers see the event stream end only after the reason is recorded
                drop(io);
            })
        };

        Self {
            outbound,
            control_tx,
            events_rx: Some(events_rx),
            shutdown,
            alive,
            close_reason,
            task: Some(task),
        }
    }

    async fn negotiate(&mut self, config: &TransportConfig) -> Result<(), TransportError> {
        self.send_control(ClientEvent::SessionUpdate {
            session: config.params.clone(),
        })
        .await?;

        let close_reason = Arc::clone(&self.close_reason);
        let events = self.events_rx.as_mut().ok_or(TransportError::Closed)?;

        let confirmation = async {
            loop {
                match events.recv().await {
                    Some(StreamEvent::SessionConfirmed) => return Ok(()),
                    Some(StreamEvent::Error { code, message }) => {
                        return Err(TransportError::Connect(format!("{}: {}", code, message)))
                    }
                    Some(other) => debug!("Ignoring {:?} before confirmation", other),
                    None => {
                        let reason = close_reason
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .clone()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "closed before confirmation".to_string());
                        return Err(TransportError::Connect(reason));
                    }
                }
            }
        };

        tokio::time::timeout(config.confirm_timeout, confirmation)
            .await
            .map_err(|_| TransportError::ConfirmTimeout(config.confirm_timeout))?
    }

    /// Queue a captured frame without waiting
    ///
    /// On `Overrun` the frame was still queued; the reported number of
    /// oldest frames were evicted to stay within the bound.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        match self.outbound.push(frame) {
            0 => Ok(()),
            dropped => Err(TransportError::Overrun { dropped }),
        }
    }

    /// Send a control message (cancel, reconfigure, commit)
    pub async fn send_control(&self, event: ClientEvent) -> Result<(), TransportError> {
        debug!("Sending {}", event.kind());
        self.control_tx
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Take the inbound event stream
    pub fn events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events_rx.take()
    }

    /// Next inbound event; `None` once the transport has closed
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        match self.events_rx.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Why the transport ended, if it ended on its own
    pub fn close_reason(&self) -> Option<TransportError> {
        self.close_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Frames waiting to be sent
    pub fn queued_frames(&self) -> usize {
        self.outbound.len()
    }

    /// Shut the stream down and release the connection (idempotent)
    pub async fn close(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };

        self.shutdown.notify_one();
        if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
            warn!("Transport did not close in time, aborting");
            task.abort();
        }
        self.alive.store(false, Ordering::SeqCst);
        self.outbound.clear();
        info!("Transport closed");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns the connection; multiplexes outbound control/audio with inbound events
struct IoTask {
    connection: Box<dyn Connection>,
    outbound: Arc<AudioQueue>,
    control_rx: mpsc::Receiver<ClientEvent>,
    events_tx: mpsc::Sender<StreamEvent>,
    shutdown: Arc<Notify>,
}

impl IoTask {
    /// Returns the failure that ended the stream, or `None` on local shutdown
    async fn run(&mut self) -> Option<TransportError> {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.connection.close().await;
                    return None;
                }
                Some(event) = self.control_rx.recv() => {
                    if let Err(e) = self.send(&event).await {
                        return Some(e);
                    }
                }
                _ = self.outbound.notified() => {
                    while let Some(frame) = self.outbound.pop() {
                        if let Err(e) = self.send(&ClientEvent::audio(&frame)).await {
                            return Some(e);
                        }
                    }
                }
                incoming = self.connection.recv() => match incoming {
                    Some(Ok(text)) => match decode_event(&text) {
                        Ok(Some(event)) => {
                            if self.events_tx.send(event).await.is_err() {
                                // Nobody is listening any more
                                self.connection.close().await;
                                return None;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Discarding inbound event: {}", e),
                    },
                    Some(Err(e)) => return Some(e),
                    None => {
                        return Some(TransportError::Dropped(
                            "Remote closed the stream".to_string(),
                        ))
                    }
                },
            }
        }
    }

    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        let text = serde_json::to_string(event)
            .map_err(|e| TransportError::Dropped(format!("Failed to encode {}: {}", event.kind(), e)))?;
        self.connection.send(text).await
    }
}
