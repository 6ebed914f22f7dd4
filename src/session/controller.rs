use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::state::{ActiveState, SessionFailure, SessionState, StateCell};
use super::stats::{Counters, SessionStats};
use crate::audio::{AudioCapture, AudioFrame, CaptureStream};
use crate::error::{CaptureError, SessionError, TransportError};
use crate::store::{ConversationStore, CredentialProvider, TokenCache};
use crate::transport::{
    ClientEvent, Connector, ReconnectPolicy, StreamEvent, TransportConfig, TransportSession,
};
use crate::turn::{ConversationLog, Persister, Role, Turn, TurnAccumulator};
use crate::vad::{VoiceActivityGate, VoiceEvent};

/// How long `stop` waits for a session it does not own the task of
const STOP_WAIT: Duration = Duration::from_secs(15);

/// External collaborators a session is built from
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub store: Arc<dyn ConversationStore>,
    pub capture: Box<dyn AudioCapture>,
}

/// State read by the API while the session task writes it
struct Shared {
    log: Mutex<ConversationLog>,
    counters: Counters,
    last_error: StdMutex<Option<SessionFailure>>,
    persister: StdMutex<Option<Arc<Persister>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A realtime voice session
///
/// Owns one conversation from `start` to `stop`: the capture device, the
/// transport to the model, turn assembly and persistence. All pipeline
/// events are evaluated one at a time on a single background task; the
/// presentation layer only observes [`SessionState`] and the last error.
pub struct SessionController {
    /// Session configuration
    config: SessionConfig,

    /// When the controller was created
    created_at: DateTime<Utc>,

    /// Observable lifecycle state
    state: StateCell,

    shared: Arc<Shared>,

    /// Cooperative stop signal, observed at every suspension point
    stop_tx: watch::Sender<bool>,

    /// Taken by `start`
    collaborators: Mutex<Option<Collaborators>>,

    /// Handle for the session task
    task: Mutex<Option<JoinHandle<()>>>,

    /// Receives assistant audio for playback
    playback: Option<mpsc::Sender<Vec<u8>>>,
}

impl SessionController {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Result<Self, SessionError> {
        config.validate()?;
        info!("Creating voice session: {}", config.session_id);

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            created_at: Utc::now(),
            state: StateCell::new(&config.session_id),
            shared: Arc::new(Shared {
                log: Mutex::new(ConversationLog::new(config.session_id.clone())),
                counters: Counters::default(),
                last_error: StdMutex::new(None),
                persister: StdMutex::new(None),
            }),
            stop_tx,
            collaborators: Mutex::new(Some(collaborators)),
            task: Mutex::new(None),
            playback: None,
            config,
        })
    }

    /// Forward assistant audio (PCM16 at the session sample rate) to `tx`
    ///
    /// Chunks are dropped when the receiver falls behind.
    pub fn with_playback(mut self, tx: mpsc::Sender<Vec<u8>>) -> Self {
        self.playback = Some(tx);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connect and begin the conversation
    ///
    /// Returns once the session is `Active.Listening`, or with the error that
    /// moved it to `Failed`.
    pub async fn start(&self) -> Result<(), SessionError> {
        // Subscribe before leaving Idle so a concurrent stop is never missed
        let mut stop_rx = self.stop_tx.subscribe();

        if !self.state.set(SessionState::Connecting) {
            return Err(SessionError::InvalidState(self.state().to_string()));
        }
        let Collaborators {
            connector,
            credentials,
            store,
            mut capture,
        } = self
            .collaborators
            .lock()
            .await
            .take()
            .ok_or_else(|| SessionError::InvalidState("already started".into()))?;

        let session_id = self.config.session_id.clone();
        info!(
            "Starting voice session {} (voice: {}, capture: {})",
            session_id,
            self.config.voice,
            capture.name()
        );

        let history = match store.load_history(&session_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!("Failed to load history for {}: {}", session_id, e);
                Vec::new()
            }
        };
        if !history.is_empty() {
            info!("Resuming session {} with {} stored turn(s)", session_id, history.len());
        }
        *self.shared.log.lock().await = ConversationLog::with_history(session_id.clone(), history);

        let persister = Arc::new(Persister::spawn(store, self.config.persist.clone()));
        *lock(&self.shared.persister) = Some(Arc::clone(&persister));

        let mut tokens = TokenCache::new(credentials, self.config.token_scope.clone());
        let transport_config = self.config.transport_config();

        let connect = async {
            let token = tokens.token().await?;
            let transport = TransportSession::open(connector.as_ref(), &token, &transport_config).await?;
            Ok::<_, SessionError>(transport)
        };
        let connected = tokio::select! {
            biased;
            _ = stop_rx.changed() => Err(SessionError::Stopped),
            result = connect => result,
        };

        let mut transport = match connected {
            Ok(transport) => transport,
            Err(SessionError::Stopped) => {
                info!("Session {} stopped while connecting", session_id);
                self.state.set(SessionState::Closing);
                self.state.set(SessionState::Closed);
                return Err(SessionError::Stopped);
            }
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let capture_rx = match capture.start().await {
            Ok(rx) => rx,
            Err(e) => {
                transport.close().await;
                let err = SessionError::from(e);
                self.fail(&err);
                return Err(err);
            }
        };

        let pipeline = Pipeline {
            session_id,
            allow_interruption: self.config.allow_interruption,
            await_transcript: self.config.transcription_enabled(),
            reconnect: self.config.reconnect.clone(),
            flush_timeout: Duration::from_millis(self.config.persist.flush_timeout_ms),
            connector,
            tokens,
            transport_config,
            transport,
            capture,
            capture_rx,
            gate: VoiceActivityGate::new(self.config.gate_config()),
            turns: TurnAccumulator::new(self.config.sample_rate),
            persister,
            state: self.state.clone(),
            shared: Arc::clone(&self.shared),
            stop_rx,
            playback: self.playback.clone(),
            user_speaking: false,
            cancelling: false,
        };

        self.state.set(SessionState::LISTENING);
        *self.task.lock().await = Some(tokio::spawn(pipeline.run()));

        info!("Voice session started successfully");
        Ok(())
    }

    /// Stop the session and release every resource
    ///
    /// Idempotent: stopping a closed or failed session returns its stats.
    pub async fn stop(&self) -> Result<SessionStats, SessionError> {
        if self.state() == SessionState::Idle && self.state.set(SessionState::Closed) {
            self.collaborators.lock().await.take();
            return Ok(self.stats());
        }
        if self.state().is_terminal() {
            debug!("Session {} already {}", self.config.session_id, self.state());
            return Ok(self.stats());
        }

        info!("Stopping voice session: {}", self.config.session_id);
        self.stop_tx.send_replace(true);

        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("Session task panicked: {}", e);
                    self.fail(&SessionError::InvalidState(format!("session task failed: {}", e)));
                }
            }
            None => {
                // Still connecting, or another caller owns the task
                let mut rx = self.state.subscribe();
                if tokio::time::timeout(STOP_WAIT, rx.wait_for(|s| s.is_terminal()))
                    .await
                    .is_err()
                {
                    warn!("Session {} did not stop within {:?}", self.config.session_id, STOP_WAIT);
                }
            }
        }

        info!("Voice session stopped: {}", self.state());
        Ok(self.stats())
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// When the session reached `Closed` or `Failed`
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.ended_at()
    }

    /// The failure that ended the session, if it failed
    pub fn last_error(&self) -> Option<SessionFailure> {
        lock(&self.shared.last_error).clone()
    }

    /// Stored history followed by this session's finalized turns
    pub async fn transcript(&self) -> Vec<Turn> {
        self.shared.log.lock().await.turns().to_vec()
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.shared.counters;
        let persister = lock(&self.shared.persister).clone();
        let duration = Utc::now().signed_duration_since(self.created_at);

        SessionStats {
            session_id: self.config.session_id.clone(),
            state: self.state(),
            created_at: self.created_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            frames_captured: Counters::read(&c.frames_captured),
            frames_sent: Counters::read(&c.frames_sent),
            frames_overrun: Counters::read(&c.frames_overrun),
            frames_dropped: Counters::read(&c.frames_dropped),
            events_received: Counters::read(&c.events_received),
            user_turns: Counters::read(&c.user_turns),
            assistant_turns: Counters::read(&c.assistant_turns),
            interruptions: Counters::read(&c.interruptions),
            reconnects: Counters::read(&c.reconnects),
            persist_pending: persister.as_ref().map(|p| p.pending()).unwrap_or(0),
            persist_failures: persister.as_ref().map(|p| p.failures()).unwrap_or(0),
            last_error: self.last_error(),
        }
    }

    fn fail(&self, err: &SessionError) {
        fail(&self.state, &self.shared, err);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn fail(state: &StateCell, shared: &Shared, err: &SessionError) {
    let failure = SessionFailure {
        reason: err.reason(),
        message: err.to_string(),
    };
    error!("Session failed ({:?}): {}", failure.reason, failure.message);
    *lock(&shared.last_error) = Some(failure.clone());
    state.set(SessionState::Failed(failure));
}

/// Everything the running session owns
struct Pipeline {
    session_id: String,
    allow_interruption: bool,
    await_transcript: bool,
    reconnect: ReconnectPolicy,
    flush_timeout: Duration,

    connector: Arc<dyn Connector>,
    tokens: TokenCache,
    transport_config: TransportConfig,
    transport: TransportSession,

    capture: Box<dyn AudioCapture>,
    capture_rx: CaptureStream,

    gate: VoiceActivityGate,
    turns: TurnAccumulator,
    persister: Arc<Persister>,

    state: StateCell,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
    playback: Option<mpsc::Sender<Vec<u8>>>,

    /// A local user turn is open and receiving audio
    user_speaking: bool,
    /// A cancel was sent; output of the cancelled response is ignored
    cancelling: bool,
}

impl Pipeline {
    async fn run(mut self) {
        info!("Session task started");

        let outcome = self.drive().await;
        let discarded = self.turns.discard_open();
        if discarded > 0 {
            debug!("Dropped {} unfinished turn(s) at shutdown", discarded);
        }

        match outcome {
            SessionError::Stopped => {
                self.state.set(SessionState::Closing);
                self.release().await;
                self.state.set(SessionState::Closed);
            }
            err => {
                self.release().await;
                fail(&self.state, &self.shared, &err);
            }
        }

        info!("Session task stopped");
    }

    /// Process events until the session must end; returns why
    async fn drive(&mut self) -> SessionError {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => Err(SessionError::Stopped),
                frame = self.capture_rx.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e)) => Err(e.into()),
                    None => Err(capture_ended().into()),
                },
                event = self.transport.next_event() => match event {
                    Some(event) => {
                        self.on_event(event).await;
                        Ok(())
                    }
                    None => self.reconnect().await,
                },
            };

            if let Err(e) = step {
                return e;
            }
        }
    }

    // ========================================================================
    // Capture side
    // ========================================================================

    async fn on_frame(&mut self, frame: AudioFrame) -> Result<(), SessionError> {
        Counters::incr(&self.shared.counters.frames_captured);

        match self.gate.classify(&frame) {
            VoiceEvent::SpeechStarted => self.on_speech_started().await,
            VoiceEvent::SpeechStopped { duration_ms } => self.on_speech_stopped(duration_ms).await,
            VoiceEvent::Speaking | VoiceEvent::Silence => {}
        }

        if self.user_speaking {
            self.turns
                .append_user_audio(frame.samples.len() * 2, frame.duration_ms());
        }

        if self.forwarding() {
            self.send_frame(frame);
        }
        Ok(())
    }

    fn phase(&self) -> Option<ActiveState> {
        match self.state.get() {
            SessionState::Active { phase } => Some(phase),
            _ => None,
        }
    }

    /// User audio goes out while listening, or while responding if it may interrupt
    fn forwarding(&self) -> bool {
        match self.phase() {
            Some(ActiveState::Listening) => true,
            Some(ActiveState::Responding) => self.allow_interruption,
            None => false,
        }
    }

    fn send_frame(&self, frame: AudioFrame) {
        let counters = &self.shared.counters;
        match self.transport.send_audio(frame) {
            Ok(()) => Counters::incr(&counters.frames_sent),
            Err(TransportError::Overrun { dropped }) => {
                Counters::incr(&counters.frames_sent);
                Counters::add(&counters.frames_overrun, dropped as u64);
                warn!("Outbound audio overrun, dropped {} oldest frame(s)", dropped);
            }
            Err(e) => debug!("Frame not sent: {}", e),
        }
    }

    async fn on_speech_started(&mut self) {
        match self.phase() {
            Some(ActiveState::Listening) => self.begin_user_turn().await,
            Some(ActiveState::Responding) if self.allow_interruption => {
                self.interrupt().await;
                self.begin_user_turn().await;
            }
            Some(ActiveState::Responding) => {
                debug!("User speech while responding, interruption disabled");
            }
            None => {}
        }
    }

    async fn begin_user_turn(&mut self) {
        if let Some(previous) = self.turns.begin_user_turn() {
            self.record(previous).await;
        }
        self.user_speaking = true;
        debug!("User turn started");
    }

    async fn on_speech_stopped(&mut self, duration_ms: u64) {
        if !self.user_speaking {
            return;
        }
        self.user_speaking = false;
        self.cancelling = false;

        if let Some(turn) = self.turns.end_user_speech(self.await_transcript) {
            self.record(turn).await;
        }
        info!("User finished speaking ({} ms)", duration_ms);
        self.state.set(SessionState::RESPONDING);
    }

    /// The user cut the assistant off
    async fn interrupt(&mut self) {
        info!("User interrupted the assistant");
        Counters::incr(&self.shared.counters.interruptions);

        if let Err(e) = self.transport.send_control(ClientEvent::ResponseCancel).await {
            warn!("Failed to cancel response: {}", e);
        }
        if let Some(turn) = self.turns.interrupt() {
            self.record(turn).await;
        }
        self.cancelling = true;
        self.state.set(SessionState::LISTENING);
    }

    // ========================================================================
    // Model side
    // ========================================================================

    async fn on_event(&mut self, event: StreamEvent) {
        Counters::incr(&self.shared.counters.events_received);

        match &event {
            StreamEvent::SessionConfirmed => debug!("Session configuration acknowledged"),
            StreamEvent::Error { code, message } => warn!("Model reported {}: {}", code, message),
            StreamEvent::SpeechStarted => debug!("Server detected speech start"),
            StreamEvent::SpeechStopped => debug!("Server detected speech stop"),
            StreamEvent::Interrupted => self.cancelling = false,
            _ => {}
        }

        if self.cancelling && is_assistant_output(&event) {
            debug!("Ignoring output of cancelled response");
            return;
        }

        if let StreamEvent::AudioDelta { bytes } = &event {
            self.play(bytes);
        }

        let Some(turn) = self.turns.ingest(&event) else {
            return;
        };
        let response_finished = turn.role == Role::Assistant;
        self.record(turn).await;

        if response_finished && self.phase() == Some(ActiveState::Responding) {
            self.state.set(SessionState::LISTENING);
            // Speech that began while gated must start a fresh utterance
            if self.gate.in_speech() && !self.user_speaking {
                self.gate.reset();
            }
        }
    }

    fn play(&self, bytes: &[u8]) {
        if let Some(tx) = &self.playback {
            if tx.try_send(bytes.to_vec()).is_err() {
                debug!("Playback is behind, dropping {} bytes", bytes.len());
            }
        }
    }

    async fn record(&mut self, turn: Turn) {
        let turn = self.shared.log.lock().await.append(turn);
        match turn.role {
            Role::User => Counters::incr(&self.shared.counters.user_turns),
            Role::Assistant => Counters::incr(&self.shared.counters.assistant_turns),
        }
        info!(
            "Turn {} finalized: {:?}{} ({} chars, {} ms audio)",
            turn.sequence,
            turn.role,
            if turn.truncated { ", truncated" } else { "" },
            turn.text().chars().count(),
            turn.audio_ms()
        );
        self.persister.save(&self.session_id, turn);
    }

    // ========================================================================
    // Recovery and shutdown
    // ========================================================================

    /// Replace a dropped transport, or fail once the retry budget is spent
    async fn reconnect(&mut self) -> Result<(), SessionError> {
        let reason = self
            .transport
            .close_reason()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "stream ended".to_string());
        warn!("Transport lost: {}", reason);
        self.transport.close().await;

        // The model cannot resume a turn on a new stream
        let discarded = self.turns.discard_open();
        if discarded > 0 {
            warn!("Discarded {} open turn(s) after transport loss", discarded);
        }
        self.user_speaking = false;
        self.cancelling = false;
        self.gate.reset();

        let mut last_error = reason;
        for (index, delay) in self.reconnect.delays().enumerate() {
            let attempt = index + 1;
            self.state.set(SessionState::Reconnecting { attempt });
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempt, self.reconnect.max_attempts
            );

            drain_until(
                &mut self.stop_rx,
                &mut self.capture_rx,
                &self.shared.counters,
                tokio::time::sleep(delay),
            )
            .await?;

            let tokens = &mut self.tokens;
            let connector = self.connector.as_ref();
            let config = &self.transport_config;
            let open = async move {
                let token = tokens.token().await?;
                let transport = TransportSession::open(connector, &token, config).await?;
                Ok::<_, SessionError>(transport)
            };

            match drain_until(&mut self.stop_rx, &mut self.capture_rx, &self.shared.counters, open).await? {
                Ok(transport) => {
                    self.transport = transport;
                    Counters::incr(&self.shared.counters.reconnects);
                    info!("Reconnected on attempt {}", attempt);
                    self.state.set(SessionState::LISTENING);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(SessionError::Transport(TransportError::Dropped(format!(
            "gave up after {} reconnect attempt(s): {}",
            self.reconnect.max_attempts, last_error
        ))))
    }

    /// Flush persistence, then release the transport and the capture device
    async fn release(&mut self) {
        let unsaved = self.persister.flush(self.flush_timeout).await;
        if unsaved > 0 {
            warn!("{} turn(s) not yet persisted at shutdown", unsaved);
        }
        self.transport.close().await;
        self.capture.stop().await;
    }
}

fn capture_ended() -> CaptureError {
    CaptureError::DeviceLost("capture stream ended".to_string())
}

fn is_assistant_output(event: &StreamEvent) -> bool {
    match event {
        StreamEvent::AudioDelta { .. } | StreamEvent::AudioDone => true,
        StreamEvent::TranscriptDelta { role, .. } | StreamEvent::TranscriptFinal { role, .. } => {
            *role == Role::Assistant
        }
        _ => false,
    }
}

/// Await `fut` while honouring stop and discarding captured frames
async fn drain_until<F: Future>(
    stop_rx: &mut watch::Receiver<bool>,
    capture_rx: &mut CaptureStream,
    counters: &Counters,
    fut: F,
) -> Result<F::Output, SessionError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => return Err(SessionError::Stopped),
            frame = capture_rx.recv() => match frame {
                Some(Ok(_)) => {
                    Counters::incr(&counters.frames_captured);
                    Counters::incr(&counters.frames_dropped);
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(capture_ended().into()),
            },
            output = &mut fut => return Ok(output),
        }
    }
}
