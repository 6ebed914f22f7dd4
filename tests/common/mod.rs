// Shared fixtures for integration tests: a scripted in-memory realtime
// endpoint, credentials, stores and audio helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use loqa_realtime::error::{CredentialError, StoreError, TransportError};
use loqa_realtime::session::{SessionController, SessionState};
use loqa_realtime::store::{AccessToken, ConversationStore, CredentialProvider, MemoryStore};
use loqa_realtime::transport::{Connection, Connector};
use loqa_realtime::turn::Turn;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How the fake endpoint answers one connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Accept and confirm the session on `session.update`
    Accept,
    /// Refuse the connection
    Refuse,
    /// Accept but never confirm
    Silent,
    /// Answer `session.update` with an `error` event
    RejectConfig,
    /// Never finish connecting
    Hang,
}

enum ServerMsg {
    Text(String),
    Close,
}

#[derive(Default)]
struct Inner {
    plans: Mutex<VecDeque<Plan>>,
    connects: AtomicUsize,
    live: AtomicUsize,
    sent: Mutex<Vec<Value>>,
    current: Mutex<Option<mpsc::UnboundedSender<ServerMsg>>>,
}

/// In-memory stand-in for the realtime endpoint
///
/// Connect attempts follow the queued plans, then default to `Accept`.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<Inner>,
}

impl ScriptedConnector {
    pub fn new(plans: impl IntoIterator<Item = Plan>) -> Self {
        let connector = Self::default();
        connector.inner.plans.lock().unwrap().extend(plans);
        connector
    }

    /// Deliver a server event on the most recent connection
    pub fn push(&self, event: Value) {
        if let Some(tx) = self.inner.current.lock().unwrap().as_ref() {
            let _ = tx.send(ServerMsg::Text(event.to_string()));
        }
    }

    /// Deliver raw text, e.g. something malformed
    pub fn push_raw(&self, text: &str) {
        if let Some(tx) = self.inner.current.lock().unwrap().as_ref() {
            let _ = tx.send(ServerMsg::Text(text.to_string()));
        }
    }

    /// The remote end closes the current stream
    pub fn drop_connection(&self) {
        if let Some(tx) = self.inner.current.lock().unwrap().take() {
            let _ = tx.send(ServerMsg::Close);
        }
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet released
    pub fn live_connections(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, kind: &str) -> usize {
        self.sent().iter().filter(|m| m["type"] == kind).count()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, token: &AccessToken) -> Result<Box<dyn Connection>, TransportError> {
        assert!(!token.token.is_empty());
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let plan = self.inner.plans.lock().unwrap().pop_front().unwrap_or(Plan::Accept);
        match plan {
            Plan::Refuse => return Err(TransportError::Connect("connection refused".into())),
            Plan::Hang => std::future::pending::<()>().await,
            _ => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.current.lock().unwrap() = Some(tx.clone());
        self.inner.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeConnection {
            plan,
            inner: Arc::clone(&self.inner),
            loopback: tx,
            inbound: rx,
            released: false,
        }))
    }
}

struct FakeConnection {
    plan: Plan,
    inner: Arc<Inner>,
    loopback: mpsc::UnboundedSender<ServerMsg>,
    inbound: mpsc::UnboundedReceiver<ServerMsg>,
    released: bool,
}

impl FakeConnection {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let message: Value = serde_json::from_str(&text).expect("client sent invalid JSON");

        if message["type"] == "session.update" {
            let reply = match self.plan {
                Plan::Accept => Some(json!({"type": "session.updated", "session": message["session"]})),
                Plan::RejectConfig => Some(json!({
                    "type": "error",
                    "error": {"type": "invalid_request_error", "code": "invalid_value", "message": "bad session"}
                })),
                Plan::Silent | Plan::Refuse | Plan::Hang => None,
            };
            if let Some(reply) = reply {
                let _ = self.loopback.send(ServerMsg::Text(reply.to_string()));
            }
        }

        self.inner.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.inbound.recv().await {
            Some(ServerMsg::Text(text)) => Some(Ok(text)),
            Some(ServerMsg::Close) | None => None,
        }
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct TestCredentials;

#[async_trait]
impl CredentialProvider for TestCredentials {
    async fn get_token(&self, _scope: &str) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::new(
            "test-key",
            chrono::Utc::now() + chrono::Duration::hours(1),
        ))
    }
}

/// Fails the first `failures` saves, then stores in memory
pub struct FlakyStore {
    remaining: AtomicUsize,
    pub attempts: AtomicUsize,
    pub inner: MemoryStore,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            inner: MemoryStore::new(),
        }
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn save_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("store unavailable".into()));
        }
        self.inner.save_turn(session_id, turn).await
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        self.inner.load_history(session_id).await
    }
}

pub const FRAME_SAMPLES: usize = 480;

/// `ms` of loud square wave at 24kHz
pub fn speech(ms: usize) -> Vec<i16> {
    (0..ms * 24)
        .map(|i| if (i / 24) % 2 == 0 { 8000 } else { -8000 })
        .collect()
}

/// `ms` of digital silence at 24kHz
pub fn silence(ms: usize) -> Vec<i16> {
    vec![0; ms * 24]
}

/// Wait until the session state satisfies `pred`
pub async fn wait_for_state(
    session: &SessionController,
    timeout: Duration,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    let mut rx = session.subscribe();
    let state = match tokio::time::timeout(timeout, rx.wait_for(pred)).await {
        Ok(Ok(state)) => state.clone(),
        _ => panic!("timed out in state {}", session.state()),
    };
    state
}

/// Poll `check` until it holds
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
