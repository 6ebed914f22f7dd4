//! External collaborators: the conversation store and the credential provider.
//!
//! The session only talks to these through the two narrow traits below.

mod credentials;
mod memory;
mod nats;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::turn::Turn;

pub use credentials::{AccessToken, CredentialProvider, EnvCredentials, StaticCredentials, TokenCache};
pub use memory::MemoryStore;
pub use nats::NatsKvStore;

/// Durable conversation history, addressed by session id
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist one finalized turn
    async fn save_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError>;

    /// All stored turns of a session, ordered by sequence
    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError>;
}
