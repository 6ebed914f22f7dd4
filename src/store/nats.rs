use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::ConversationStore;
use crate::error::StoreError;
use crate::turn::Turn;

/// Conversation store backed by a NATS JetStream key-value bucket
///
/// Each turn is one JSON entry under `<session_id>.<sequence>`, with the
/// sequence zero-padded so keys sort in conversation order.
pub struct NatsKvStore {
    bucket: kv::Store,
}

impl NatsKvStore {
    /// Connect to NATS and open (or create) the bucket
    pub async fn connect(url: &str, bucket: &str) -> Result<Self, StoreError> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to connect to NATS: {}", e)))?;
        let jetstream = jetstream::new(client);

        let bucket = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(_) => {
                info!("Creating key-value bucket {}", bucket);
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| {
                        StoreError::Backend(format!("Failed to create bucket {}: {}", bucket, e))
                    })?
            }
        };

        info!("Connected to NATS successfully");
        Ok(Self { bucket })
    }

    fn key(session_id: &str, sequence: u64) -> String {
        format!("{}.{:08}", session_id, sequence)
    }
}

#[async_trait]
impl ConversationStore for NatsKvStore {
    async fn save_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
        let key = Self::key(session_id, turn.sequence);
        let payload = serde_json::to_vec(turn).map_err(|e| StoreError::Encode(e.to_string()))?;

        self.bucket
            .put(key.as_str(), payload.into())
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to put {}: {}", key, e)))?;

        debug!("Stored {}", key);
        Ok(())
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let prefix = format!("{}.", session_id);
        let mut keys = self
            .bucket
            .keys()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to list keys: {}", e)))?;

        let mut session_keys = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| StoreError::Backend(format!("Failed to list keys: {}", e)))?;
            if key.starts_with(&prefix) {
                session_keys.push(key);
            }
        }
        session_keys.sort();

        let mut turns = Vec::with_capacity(session_keys.len());
        for key in session_keys {
            let entry = self
                .bucket
                .get(key.as_str())
                .await
                .map_err(|e| StoreError::Backend(format!("Failed to get {}: {}", key, e)))?;

            // Deleted between listing and reading
            let Some(bytes) = entry else { continue };

            let turn: Turn =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(format!("{}: {}", key, e)))?;
            turns.push(turn);
        }

        turns.sort_by_key(|t| t.sequence);
        info!("Loaded {} turn(s) for session {}", turns.len(), session_id);
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_sort_in_sequence_order() {
        let mut keys = vec![
            NatsKvStore::key("s1", 10),
            NatsKvStore::key("s1", 2),
            NatsKvStore::key("s1", 1),
        ];
        keys.sort();
        assert_eq!(keys, vec!["s1.00000001", "s1.00000002", "s1.00000010"]);
    }
}
