mod common;

use common::{eventually, silence, speech, wait_for_state, FlakyStore, Plan, ScriptedConnector, TestCredentials};
use loqa_realtime::audio::{ChannelCapture, FrameSink};
use loqa_realtime::error::{ReasonCode, SessionError};
use loqa_realtime::session::{Collaborators, SessionConfig, SessionController, SessionState, Voice};
use loqa_realtime::store::{ConversationStore, MemoryStore};
use loqa_realtime::transport::ReconnectPolicy;
use loqa_realtime::turn::{PersistConfig, Role};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config(session_id: &str) -> SessionConfig {
    SessionConfig {
        session_id: session_id.to_string(),
        voice: Voice::Shimmer,
        silence_duration_ms: 500,
        confirm_timeout_ms: 1_000,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            factor: 2.0,
            max_delay_ms: 40,
        },
        persist: PersistConfig {
            retry_base_ms: 10,
            retry_max_ms: 50,
            max_attempts: 5,
            flush_timeout_ms: 1_000,
            save_timeout_ms: 1_000,
        },
        ..SessionConfig::default()
    }
}

fn build(
    config: SessionConfig,
    connector: &ScriptedConnector,
    store: Arc<dyn ConversationStore>,
) -> (SessionController, FrameSink) {
    let (capture, sink) = ChannelCapture::new(config.capture_config());
    let session = SessionController::new(
        config,
        Collaborators {
            connector: Arc::new(connector.clone()),
            credentials: Arc::new(TestCredentials),
            store,
            capture: Box::new(capture),
        },
    )
    .unwrap();
    (session, sink)
}

/// One complete utterance: 3s of speech then 600ms of silence
async fn utterance(sink: &FrameSink) {
    sink.send(&speech(3_000)).await;
    sink.send(&silence(600)).await;
}

async fn responding(session: &SessionController, sink: &FrameSink) {
    utterance(sink).await;
    wait_for_state(session, WAIT, |s| *s == SessionState::RESPONDING).await;
}

fn reason(session: &SessionController) -> ReasonCode {
    match session.state() {
        SessionState::Failed(failure) => failure.reason,
        other => panic!("expected failed session, got {}", other),
    }
}

#[tokio::test]
async fn test_single_utterance_becomes_one_user_turn() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-basic"), &connector, Arc::new(MemoryStore::new()));

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::LISTENING);

    let update = &connector.sent()[0];
    assert_eq!(update["type"], "session.update");
    assert_eq!(update["session"]["voice"], "shimmer");
    assert_eq!(update["session"]["turn_detection"]["silence_duration_ms"], 500);

    responding(&session, &sink).await;

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].sequence, 0);
    assert!(transcript[0].complete);
    assert!(transcript[0].audio_ms() >= 2_900);

    eventually(WAIT, || connector.sent_count("input_audio_buffer.append") > 0).await;
    let stats = session.stats();
    assert_eq!(stats.user_turns, 1);
    assert_eq!(stats.assistant_turns, 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_assistant_response_returns_to_listening() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-reply"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();
    responding(&session, &sink).await;

    connector.push(json!({"type": "response.audio_transcript.delta", "delta": "Hello"}));
    connector.push(json!({"type": "response.audio.delta", "delta": "AAAAAA=="}));
    connector.push(json!({"type": "response.audio_transcript.delta", "delta": " there"}));
    connector.push(json!({"type": "response.audio.done"}));
    connector.push(json!({"type": "response.audio_transcript.done", "transcript": "Hello there"}));

    wait_for_state(&session, WAIT, |s| *s == SessionState::LISTENING).await;
    eventually(WAIT, || session.stats().events_received >= 5).await;

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 2, "trailing transcript must not open a second turn");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].text(), "Hello there");
    assert!(!transcript[1].truncated);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_user_speech_interrupts_assistant() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-interrupt"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();
    responding(&session, &sink).await;

    connector.push(json!({"type": "response.audio_transcript.delta", "delta": "Let me"}));
    connector.push(json!({"type": "response.audio.delta", "delta": "AAAAAA=="}));
    eventually(WAIT, || session.stats().events_received >= 2).await;

    sink.send(&speech(200)).await;

    eventually(WAIT, || connector.sent_count("response.cancel") == 1).await;
    wait_for_state(&session, WAIT, |s| *s == SessionState::LISTENING).await;

    // Output of the cancelled response is ignored
    connector.push(json!({"type": "response.audio_transcript.delta", "delta": " think"}));
    connector.push(json!({"type": "response.done", "response": {"status": "cancelled"}}));
    eventually(WAIT, || session.stats().events_received >= 4).await;

    let transcript = session.transcript().await;
    assert_eq!(transcript.len(), 2);
    let assistant = &transcript[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert!(assistant.truncated);
    assert_eq!(assistant.text(), "Let me");
    assert_eq!(session.stats().interruptions, 1);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_interruption_disabled_ignores_user_audio_while_responding() {
    let connector = ScriptedConnector::default();
    let config = SessionConfig {
        allow_interruption: false,
        ..config("s-no-interrupt")
    };
    let (session, sink) = build(config, &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();
    responding(&session, &sink).await;

    let before = session.stats();
    sink.send(&speech(400)).await;
    eventually(WAIT, || session.stats().frames_captured >= before.frames_captured + 20).await;

    let after = session.stats();
    assert_eq!(after.frames_sent, before.frames_sent);
    assert_eq!(after.interruptions, 0);
    assert_eq!(connector.sent_count("response.cancel"), 0);
    assert_eq!(session.state(), SessionState::RESPONDING);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_transcription_holds_user_turn_until_final() {
    let connector = ScriptedConnector::default();
    let config = SessionConfig {
        transcription_model: Some("whisper-1".to_string()),
        ..config("s-transcribe")
    };
    let (session, sink) = build(config, &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();
    assert_eq!(connector.sent()[0]["session"]["input_audio_transcription"]["model"], "whisper-1");

    responding(&session, &sink).await;
    assert!(session.transcript().await.is_empty());

    connector.push(json!({
        "type": "conversation.item.input_audio_transcription.completed",
        "item_id": "item_1",
        "content_index": 0,
        "transcript": "what time is it"
    }));
    eventually(WAIT, || session.stats().user_turns == 1).await;

    let transcript = session.transcript().await;
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].text(), "what time is it");
    assert!(transcript[0].audio_ms() > 0);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_gives_up_after_retry_budget() {
    let connector = ScriptedConnector::new([Plan::Accept, Plan::Refuse, Plan::Refuse, Plan::Refuse]);
    let (session, sink) = build(config("s-drop"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    connector.drop_connection();

    wait_for_state(&session, WAIT, |s| s.is_terminal()).await;
    assert_eq!(reason(&session), ReasonCode::TransportDropped);
    assert_eq!(connector.connects(), 4);
    assert_eq!(connector.live_connections(), 0);
    assert!(!sink.is_active());

    let failure = session.last_error().unwrap();
    assert!(failure.message.contains("3 reconnect attempt"), "{}", failure.message);
}

#[tokio::test]
async fn test_stalled_reconnects_count_against_budget() {
    let connector = ScriptedConnector::new([Plan::Accept, Plan::Hang, Plan::Hang, Plan::Hang]);
    let config = SessionConfig {
        connect_timeout_ms: 50,
        ..config("s-stall")
    };
    let (session, sink) = build(config, &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    connector.drop_connection();

    wait_for_state(&session, WAIT, |s| s.is_terminal()).await;
    assert_eq!(reason(&session), ReasonCode::TransportDropped);
    assert_eq!(connector.connects(), 4);
    assert_eq!(connector.live_connections(), 0);
    assert!(!sink.is_active());
}

#[tokio::test]
async fn test_reconnect_resumes_listening() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-reconnect"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    connector.drop_connection();
    eventually(WAIT, || session.stats().reconnects == 1).await;
    wait_for_state(&session, WAIT, |s| *s == SessionState::LISTENING).await;

    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.sent_count("session.update"), 2);
    assert_eq!(connector.live_connections(), 1);

    // The new stream carries the next utterance
    responding(&session, &sink).await;
    assert_eq!(session.transcript().await.len(), 1);

    session.stop().await.unwrap();
    assert_eq!(connector.live_connections(), 0);
}

#[tokio::test]
async fn test_store_failures_do_not_affect_session() {
    let connector = ScriptedConnector::default();
    let store = Arc::new(FlakyStore::new(2));
    let (session, sink) = build(config("s-store"), &connector, store.clone());
    session.start().await.unwrap();
    responding(&session, &sink).await;

    assert_eq!(session.transcript().await.len(), 1);
    assert_eq!(session.state(), SessionState::RESPONDING);

    eventually(WAIT, || session.stats().persist_failures >= 1).await;
    let mut saved = Vec::new();
    for _ in 0..100 {
        saved = store.inner.load_history("s-store").await.unwrap();
        if !saved.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].role, Role::User);
    eventually(WAIT, || session.stats().persist_pending == 0).await;

    session.stop().await.unwrap();
}

#[tokio::test]
async fn test_history_continues_sequence() {
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());

    let connector = ScriptedConnector::default();
    let (first, sink) = build(config("s-resume"), &connector, Arc::clone(&store));
    first.start().await.unwrap();
    responding(&first, &sink).await;
    first.stop().await.unwrap();

    let connector = ScriptedConnector::default();
    let (second, sink) = build(config("s-resume"), &connector, Arc::clone(&store));
    second.start().await.unwrap();
    assert_eq!(second.transcript().await.len(), 1);

    responding(&second, &sink).await;
    let transcript = second.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[1].sequence, 1);
    second.stop().await.unwrap();

    assert_eq!(store.load_history("s-resume").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_stop_releases_everything_and_is_idempotent() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-stop"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();
    assert!(sink.is_active());

    let stats = session.stop().await.unwrap();
    assert_eq!(stats.state, SessionState::Closed);
    assert_eq!(connector.live_connections(), 0);
    assert!(!sink.is_active());

    let again = session.stop().await.unwrap();
    assert_eq!(again.state, SessionState::Closed);
    assert!(session.last_error().is_none());
}

#[tokio::test]
async fn test_stop_before_start_closes_idle_session() {
    let connector = ScriptedConnector::default();
    let (session, _sink) = build(config("s-idle"), &connector, Arc::new(MemoryStore::new()));

    let stats = session.stop().await.unwrap();
    assert_eq!(stats.state, SessionState::Closed);
    assert!(matches!(session.start().await, Err(SessionError::InvalidState(_))));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_stop_interrupts_reconnect_backoff() {
    let connector = ScriptedConnector::default();
    let config = SessionConfig {
        reconnect: ReconnectPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..ReconnectPolicy::default()
        },
        ..config("s-backoff")
    };
    let (session, sink) = build(config, &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    connector.drop_connection();
    wait_for_state(&session, WAIT, |s| matches!(s, SessionState::Reconnecting { .. })).await;

    // Frames captured meanwhile are dropped, not queued
    sink.send(&speech(100)).await;

    let stats = tokio::time::timeout(Duration::from_secs(1), session.stop())
        .await
        .expect("stop must not wait for the backoff")
        .unwrap();
    assert_eq!(stats.state, SessionState::Closed);
    assert_eq!(connector.connects(), 1);
    assert!(!sink.is_active());
}

#[tokio::test]
async fn test_unconfirmed_session_times_out() {
    let connector = ScriptedConnector::new([Plan::Silent]);
    let config = SessionConfig {
        confirm_timeout_ms: 100,
        ..config("s-silent")
    };
    let (session, _sink) = build(config, &connector, Arc::new(MemoryStore::new()));

    let err = session.start().await.unwrap_err();
    assert_eq!(err.reason(), ReasonCode::ConfirmTimeout);
    assert_eq!(reason(&session), ReasonCode::ConfirmTimeout);
    assert_eq!(connector.live_connections(), 0);
}

#[tokio::test]
async fn test_rejected_configuration_is_connect_error() {
    let connector = ScriptedConnector::new([Plan::RejectConfig]);
    let (session, _sink) = build(config("s-reject"), &connector, Arc::new(MemoryStore::new()));

    assert!(session.start().await.is_err());
    assert_eq!(reason(&session), ReasonCode::ConnectError);
    assert!(session.last_error().unwrap().message.contains("invalid_value"));
    assert_eq!(connector.live_connections(), 0);
}

#[tokio::test]
async fn test_refused_connection_fails_start() {
    let connector = ScriptedConnector::new([Plan::Refuse]);
    let (session, sink) = build(config("s-refused"), &connector, Arc::new(MemoryStore::new()));

    assert!(session.start().await.is_err());
    assert_eq!(reason(&session), ReasonCode::ConnectError);
    assert!(!sink.is_active());

    // Failed is terminal
    assert!(session.start().await.is_err());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_device_loss_fails_session() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-device"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    sink.send(&speech(200)).await;
    sink.fail("unplugged").await;

    wait_for_state(&session, WAIT, |s| s.is_terminal()).await;
    assert_eq!(reason(&session), ReasonCode::DeviceLost);
    assert_eq!(connector.live_connections(), 0);

    // The utterance in progress was discarded
    assert!(session.transcript().await.is_empty());
}

#[tokio::test]
async fn test_protocol_noise_is_discarded() {
    let connector = ScriptedConnector::default();
    let (session, sink) = build(config("s-noise"), &connector, Arc::new(MemoryStore::new()));
    session.start().await.unwrap();

    connector.push_raw("{not json");
    connector.push(json!({"type": "response.hologram.delta"}));
    connector.push(json!({"type": "rate_limits.updated", "rate_limits": []}));
    connector.push(json!({"type": "error", "error": {"type": "server_error", "message": "hiccup"}}));
    eventually(WAIT, || session.stats().events_received >= 1).await;

    assert_eq!(session.state(), SessionState::LISTENING);
    responding(&session, &sink).await;

    session.stop().await.unwrap();
}
