//! Best-effort persistence of finalized turns.
//!
//! `Persister::save` hands a turn to a background task and returns at once.
//! Failed saves are retried with exponential backoff; the in-memory log is
//! never affected by the store's health.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::model::Turn;
use crate::error::StoreError;
use crate::store::ConversationStore;

/// Retry schedule for failed saves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Total attempts per turn, the first included
    pub max_attempts: usize,
    /// How long `stop` waits for outstanding saves
    pub flush_timeout_ms: u64,
    /// A single store call running longer counts as a failed attempt
    pub save_timeout_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 500,
            retry_max_ms: 30_000,
            max_attempts: 5,
            flush_timeout_ms: 5_000,
            save_timeout_ms: 10_000,
        }
    }
}

impl PersistConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.retry_base_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_ms))
            .with_max_times(self.max_attempts.saturating_sub(1))
            .build()
    }
}

enum Command {
    Save { session_id: String, turn: Turn },
    Flush(oneshot::Sender<()>),
}

/// Counters shared between the handle and the worker
#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    saved: AtomicU64,
    failures: AtomicU64,
    abandoned: AtomicU64,
}

/// Handle to the background save task
pub struct Persister {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    task: JoinHandle<()>,
}

impl Persister {
    pub fn spawn(store: Arc<dyn ConversationStore>, config: PersistConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            store,
            config,
            rx,
            retries: VecDeque::new(),
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(worker.run());

        Self { tx, counters, task }
    }

    /// Queue a turn for saving; never waits on the store
    pub fn save(&self, session_id: &str, turn: Turn) {
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        let command = Command::Save {
            session_id: session_id.to_string(),
            turn,
        };
        if self.tx.send(command).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            error!("Persistence task is gone, turn not saved");
        }
    }

    /// Turns queued or awaiting retry
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    pub fn saved(&self) -> u64 {
        self.counters.saved.load(Ordering::SeqCst)
    }

    /// Failed save attempts so far
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::SeqCst)
    }

    /// Turns given up on after the last retry
    pub fn abandoned(&self) -> u64 {
        self.counters.abandoned.load(Ordering::SeqCst)
    }

    /// Try every outstanding save once more, waiting up to `timeout`
    ///
    /// Returns the number of turns still unsaved.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(reply_tx)).is_ok()
            && tokio::time::timeout(timeout, reply_rx).await.is_err()
        {
            warn!("Persistence flush timed out after {:?}", timeout);
        }
        self.pending()
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Retry {
    session_id: String,
    turn: Turn,
    attempt: usize,
    backoff: ExponentialBackoff,
    due: Instant,
}

struct Worker {
    store: Arc<dyn ConversationStore>,
    config: PersistConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    retries: VecDeque<Retry>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let next_due = self.retries.iter().map(|r| r.due).min();
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Save { session_id, turn }) => {
                        let retry = Retry {
                            session_id,
                            turn,
                            attempt: 0,
                            backoff: self.config.backoff(),
                            due: Instant::now(),
                        };
                        self.attempt(retry).await;
                    }
                    Some(Command::Flush(reply)) => {
                        for retry in std::mem::take(&mut self.retries) {
                            self.attempt(retry).await;
                        }
                        let _ = reply.send(());
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    let (due, waiting): (Vec<_>, Vec<_>) =
                        std::mem::take(&mut self.retries).into_iter().partition(|r| r.due <= now);
                    self.retries = waiting.into();
                    for retry in due {
                        self.attempt(retry).await;
                    }
                }
            }
        }
        debug!("Persistence task finished");
    }

    async fn attempt(&mut self, mut retry: Retry) {
        retry.attempt += 1;
        let limit = Duration::from_millis(self.config.save_timeout_ms);
        let result = tokio::time::timeout(limit, self.store.save_turn(&retry.session_id, &retry.turn))
            .await
            .unwrap_or_else(|_| Err(StoreError::Backend(format!("save timed out after {:?}", limit))));
        match result {
            Ok(()) => {
                debug!(
                    "Saved turn {} of session {}",
                    retry.turn.sequence, retry.session_id
                );
                self.counters.saved.fetch_add(1, Ordering::SeqCst);
                self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::SeqCst);
                match retry.backoff.next() {
                    Some(delay) => {
                        warn!(
                            "Saving turn {} failed (attempt {}): {}; retrying in {:?}",
                            retry.turn.sequence, retry.attempt, e, delay
                        );
                        retry.due = Instant::now() + delay;
                        self.retries.push_back(retry);
                    }
                    None => {
                        error!(
                            "Giving up on turn {} of session {} after {} attempts: {}",
                            retry.turn.sequence, retry.session_id, retry.attempt, e
                        );
                        self.counters.abandoned.fetch_add(1, Ordering::SeqCst);
                        self.counters.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }
        }
    }
}
