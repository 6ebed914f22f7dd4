pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod store;
pub mod transport;
pub mod turn;
pub mod vad;

pub use audio::{AudioCapture, AudioFile, AudioFrame, CaptureConfig, ChannelCapture, FrameSink, WavCapture};
pub use config::Config;
pub use error::{CaptureError, ReasonCode, SessionError, StoreError, TransportError};
pub use http::{create_router, AppState};
pub use session::{Collaborators, SessionConfig, SessionController, SessionState, SessionStats, Voice};
pub use store::{ConversationStore, CredentialProvider, MemoryStore, NatsKvStore};
pub use transport::{Connector, StreamEvent, TransportSession, WebSocketConnector};
pub use turn::{ConversationLog, Role, Turn, TurnAccumulator};
pub use vad::{VoiceActivityGate, VoiceEvent};
