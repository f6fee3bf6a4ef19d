//! End-to-end session tests against a real worker process.

use std::sync::Arc;
use std::time::Duration;

use orchestrator::{
    Config, ManualApproval, MemoryCredentialStore, SessionError, StreamStatus, ToolRegistry,
    WorkerHost, DEFAULT_SYSTEM_PROMPT,
};
use wire_types::{AssistEvent, ProviderConfig, Role};

fn host(port: u16) -> (Arc<WorkerHost>, Arc<MemoryCredentialStore>) {
    let config = Config::for_worker(env!("CARGO_BIN_EXE_worker-stub"), port);
    let credentials = Arc::new(MemoryCredentialStore::new());
    let host = WorkerHost::new(
        config,
        Arc::clone(&credentials) as Arc<dyn orchestrator::CredentialStore>,
        ToolRegistry::new(),
        Arc::new(ManualApproval),
    );
    (host, credentials)
}

fn local_config() -> ProviderConfig {
    ProviderConfig::local("http://127.0.0.1:11434", "test-model")
}

/// Drain a stream to its end, splitting tokens from the terminal event.
async fn drain(
    stream: &mut orchestrator::AssistStream,
) -> (Vec<String>, Option<AssistEvent>) {
    let mut tokens = Vec::new();
    let mut terminal = None;
    while let Some(event) = stream.next_event().await {
        match event {
            AssistEvent::Token { token } => tokens.push(token),
            other => {
                terminal = Some(other);
                break;
            }
        }
    }
    (tokens, terminal)
}

#[tokio::test]
async fn message_round_trip_appends_both_turns() {
    let (host, _) = host(7721);

    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();
    assert_eq!(session.system_prompt, DEFAULT_SYSTEM_PROMPT);
    assert!(session.history.is_empty());

    let mut stream = host.send_message(session.id, "hello world").await.unwrap();
    let (tokens, terminal) = drain(&mut stream).await;

    let full: String = tokens.concat();
    assert_eq!(full, "echo: hello world");
    match terminal {
        Some(AssistEvent::Complete { full_content, metadata }) => {
            assert_eq!(full_content, "echo: hello world");
            assert_eq!(metadata.tokens_emitted, tokens.len() as u64);
        }
        other => panic!("expected Complete, got {other:?}"),
    }

    // The relay settles right after the terminal event; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = host.get_session(session.id).await.unwrap();
    assert_eq!(session.history.len(), 2);
    assert_eq!(session.history[0].role, Role::User);
    assert_eq!(session.history[0].content, "hello world");
    assert_eq!(session.history[1].role, Role::Assistant);
    assert_eq!(session.history[1].content, "echo: hello world");

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_send_on_same_session_is_rejected() {
    let (host, _) = host(7722);
    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();

    let mut stream = host
        .send_message(session.id, "one two three four five six")
        .await
        .unwrap();

    let err = host.send_message(session.id, "too eager").await.unwrap_err();
    assert!(matches!(err, SessionError::StreamInProgress(_)));

    // Once the first stream finishes, the session accepts messages
    // again.
    drain(&mut stream).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = host.send_message(session.id, "next").await.unwrap();
    drain(&mut second).await;

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_the_stream_and_keeps_only_the_user_turn() {
    let (host, _) = host(7723);
    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();

    let mut stream = host
        .send_message(
            session.id,
            "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu",
        )
        .await
        .unwrap();
    let stream_id = stream.stream_id();

    // Take a couple of tokens, then cancel mid-stream.
    for _ in 0..2 {
        assert!(matches!(
            stream.next_event().await,
            Some(AssistEvent::Token { .. })
        ));
    }
    host.cancel_stream(stream_id).await.unwrap();

    // Whatever is still buffered drains, but no completion marker ever
    // arrives and the channel closes.
    let (_, terminal) = drain(&mut stream).await;
    assert!(terminal.is_none());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let info = host.stream_info(stream_id).unwrap();
    assert_eq!(info.status, StreamStatus::Cancelled);
    assert!(info.cancel_requested);

    // The assistant turn is only recorded on completion.
    let session = host.get_session(session.id).await.unwrap();
    assert_eq!(session.history.len(), 1);
    assert_eq!(session.history[0].role, Role::User);

    // The session is usable again.
    let mut retry = host.send_message(session.id, "short").await.unwrap();
    let (_, terminal) = drain(&mut retry).await;
    assert!(matches!(terminal, Some(AssistEvent::Complete { .. })));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn mid_stream_error_surfaces_and_history_keeps_user_turn() {
    let (host, _) = host(7724);
    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();

    let mut stream = host
        .send_message(session.id, "please fail_mid right now")
        .await
        .unwrap();
    let (tokens, terminal) = drain(&mut stream).await;

    assert!(!tokens.is_empty());
    assert!(matches!(terminal, Some(AssistEvent::Error { .. })));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = host.get_session(session.id).await.unwrap();
    assert_eq!(session.history.len(), 1);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn hosted_sessions_resolve_credentials_without_exposing_them() {
    let (host, credentials) = host(7725);
    credentials.insert("hosted-key", "sk-secret-123");

    let config = ProviderConfig::hosted("https://api.example.com", "gpt-x", "hosted-key");
    let session = host
        .create_session(config.clone(), vec![], None)
        .await
        .unwrap();

    // The session snapshot carries only the opaque reference.
    let debug = format!("{session:?}");
    let json = serde_json::to_string(&session).unwrap();
    assert!(!debug.contains("sk-secret-123"));
    assert!(!json.contains("sk-secret-123"));
    assert!(json.contains("hosted-key"));

    // An unresolvable reference fails before any session is created.
    let mut bad = config;
    bad.credential_ref = Some("no-such-ref".into());
    let err = host.create_session(bad, vec![], None).await.unwrap_err();
    assert!(matches!(err, SessionError::ConfigInvalid(_)));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_crash_fails_open_streams_and_notifies_consumers() {
    let (host, _) = host(7727);
    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();

    let mut stream = host
        .send_message(
            session.id,
            "uno dos tres cuatro cinco seis siete ocho nueve diez once doce trece catorce quince",
        )
        .await
        .unwrap();
    let stream_id = stream.stream_id();

    for _ in 0..2 {
        assert!(matches!(
            stream.next_event().await,
            Some(AssistEvent::Token { .. })
        ));
    }

    // Kill the worker out from under the open stream.
    let base = host.worker_status().base_address.unwrap();
    reqwest::Client::new()
        .post(format!("{base}/exit"))
        .send()
        .await
        .unwrap();

    // The consumer is told, not left to idle out.
    let terminal = loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next_event()).await {
            Ok(Some(AssistEvent::Token { .. })) => continue,
            Ok(event) => break event,
            Err(_) => panic!("consumer was never notified of the crash"),
        }
    };
    assert!(matches!(terminal, Some(AssistEvent::Error { .. })));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let info = host.stream_info(stream_id).unwrap();
    assert_eq!(info.status, StreamStatus::Failed);

    // The in-flight flag was cleared with the stream: a follow-up send
    // fails on the dead transport, never as a stream still in progress.
    let err = host
        .send_message(session.id, "still there")
        .await
        .unwrap_err();
    assert!(!matches!(err, SessionError::StreamInProgress(_)));

    // Only the user turn of the failed exchange is recorded.
    let session = host.get_session(session.id).await.unwrap();
    assert_eq!(session.history.len(), 2);
    assert!(session
        .history
        .iter()
        .all(|turn| turn.role == Role::User));

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn closed_sessions_reject_messages() {
    let (host, _) = host(7726);
    let session = host
        .create_session(local_config(), vec![], None)
        .await
        .unwrap();

    host.close_session(session.id).await.unwrap();
    // Idempotent.
    host.close_session(session.id).await.unwrap();

    let err = host.send_message(session.id, "anyone there").await.unwrap_err();
    assert!(matches!(err, SessionError::Closed(_)));

    let err = host
        .send_message(uuid::Uuid::new_v4(), "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));

    host.shutdown().await.unwrap();
}
