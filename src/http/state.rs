use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

use crate::audio::{AudioCapture, WavCapture};
use crate::session::{Collaborators, SessionConfig, SessionController};
use crate::store::{ConversationStore, CredentialProvider};
use crate::transport::Connector;

/// Builds the capture device for a new session
pub trait CaptureFactory: Send + Sync {
    fn create(&self, config: &SessionConfig, wav_path: Option<&str>) -> Result<Box<dyn AudioCapture>>;
}

/// WAV replay when a path is given, otherwise the default microphone
/// (only with the `microphone` feature)
pub struct DeviceCaptureFactory;

impl CaptureFactory for DeviceCaptureFactory {
    fn create(&self, config: &SessionConfig, wav_path: Option<&str>) -> Result<Box<dyn AudioCapture>> {
        if let Some(path) = wav_path {
            return Ok(Box::new(WavCapture::new(path, config.capture_config())));
        }

        #[cfg(feature = "microphone")]
        return Ok(Box::new(crate::audio::MicrophoneCapture::new(config.capture_config())));

        #[cfg(not(feature = "microphone"))]
        anyhow::bail!("No capture device: pass a WAV path or build with the `microphone` feature")
    }
}

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Sessions started through the API (session_id → controller)
    pub sessions: Arc<RwLock<HashMap<String, Arc<SessionController>>>>,

    /// Template for new sessions
    pub defaults: SessionConfig,

    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub store: Arc<dyn ConversationStore>,
    pub captures: Arc<dyn CaptureFactory>,

    /// How long a closed or failed session stays queryable
    pub retention: Duration,
}

/// Default for [`AppState::retention`]
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

impl AppState {
    pub fn new(
        defaults: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        store: Arc<dyn ConversationStore>,
        captures: Arc<dyn CaptureFactory>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            defaults,
            connector,
            credentials,
            store,
            captures,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Drop sessions that ended longer than `retention` ago; returns how many
    pub async fn evict_finished(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let evicted = prune_finished(&mut sessions, self.retention);
        if evicted > 0 {
            info!("Evicted {} finished session(s)", evicted);
        }
        evicted
    }

    /// Create (but do not start) a session
    pub fn build_session(&self, config: SessionConfig, wav_path: Option<&str>) -> Result<SessionController> {
        let capture = self.captures.create(&config, wav_path)?;
        let collaborators = Collaborators {
            connector: Arc::clone(&self.connector),
            credentials: Arc::clone(&self.credentials),
            store: Arc::clone(&self.store),
            capture,
        };
        Ok(SessionController::new(config, collaborators)?)
    }
}

/// Remove every terminal session older than `retention` from `sessions`
pub(crate) fn prune_finished(
    sessions: &mut HashMap<String, Arc<SessionController>>,
    retention: Duration,
) -> usize {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return 0;
    };
    let cutoff = chrono::Utc::now() - retention;
    let before = sessions.len();
    sessions.retain(|_, session| match session.ended_at() {
        Some(ended) => ended > cutoff,
        None => true,
    });
    before - sessions.len()
}
