use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::ConversationStore;
use crate::error::StoreError;
use crate::turn::Turn;

/// In-process store for development, `serve` without NATS, and tests
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session's history
    pub async fn insert(&self, session_id: &str, turns: Vec<Turn>) {
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), turns);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let turns = sessions.entry(session_id.to_string()).or_default();

        // Retried saves overwrite rather than duplicate
        match turns.iter_mut().find(|t| t.sequence == turn.sequence) {
            Some(existing) => *existing = turn.clone(),
            None => turns.push(turn.clone()),
        }
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut turns = sessions.get(session_id).cloned().unwrap_or_default();
        turns.sort_by_key(|t| t.sequence);
        Ok(turns)
    }
}
