//! Lifecycle tests against a real worker process.
//!
//! Each test uses its own loopback port so they can run in parallel.

use std::time::Duration;

use orchestrator::{Config, SupervisorError, WorkerEvent, WorkerStatus, WorkerSupervisor};

fn config(port: u16) -> Config {
    let mut config = Config::for_worker(env!("CARGO_BIN_EXE_worker-stub"), port);
    config.monitor_interval = Duration::from_millis(200);
    config.exit_watch_interval = Duration::from_millis(100);
    config
}

async fn wait_for_status(
    supervisor: &WorkerSupervisor,
    wanted: WorkerStatus,
    deadline: Duration,
) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if supervisor.status().status == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn start_reaches_running_and_stop_reaches_stopped() {
    let supervisor = WorkerSupervisor::new(config(7711));

    supervisor.start().await.unwrap();
    let handle = supervisor.status();
    assert_eq!(handle.status, WorkerStatus::Running);
    assert!(handle.pid.is_some());
    assert_eq!(
        handle.base_address.as_deref(),
        Some("http://127.0.0.1:7711")
    );
    assert!(handle.started_at.is_some());

    supervisor.health_check().await.unwrap();

    // Idempotent: a second start spawns nothing and changes nothing.
    let pid = handle.pid;
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status().pid, pid);

    supervisor.stop().await.unwrap();
    let handle = supervisor.status();
    assert_eq!(handle.status, WorkerStatus::Stopped);
    assert!(handle.pid.is_none());
    assert!(handle.base_address.is_none());

    // Idempotent the other way too.
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.status().status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let supervisor = WorkerSupervisor::new(config(7712));
    let mut events = supervisor.subscribe();

    supervisor.start().await.unwrap();
    match events.recv().await.unwrap() {
        WorkerEvent::Started { base_address } => {
            assert_eq!(base_address, "http://127.0.0.1:7712");
        }
        other => panic!("expected Started, got {other:?}"),
    }

    supervisor.stop().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        WorkerEvent::Stopped
    ));
}

#[tokio::test]
async fn crash_is_detected_and_worker_can_be_restarted() {
    let supervisor = WorkerSupervisor::new(config(7713));
    let mut events = supervisor.subscribe();

    supervisor.start().await.unwrap();
    let base = supervisor.base_address().unwrap();

    // Crash hook: the stub aborts shortly after answering.
    reqwest::Client::new()
        .post(format!("{base}/exit"))
        .send()
        .await
        .unwrap();

    assert!(
        wait_for_status(&supervisor, WorkerStatus::Error, Duration::from_secs(5)).await,
        "crash was not detected"
    );
    let handle = supervisor.status();
    assert!(handle.base_address.is_none());
    assert!(handle.last_error.is_some());

    // The Started event from the initial start comes first.
    loop {
        match events.recv().await.unwrap() {
            WorkerEvent::Crashed { exit_code } => {
                assert_eq!(exit_code, Some(9));
                break;
            }
            WorkerEvent::Started { .. } => continue,
            other => panic!("expected Crashed, got {other:?}"),
        }
    }

    // Error is not terminal for the supervisor: an explicit start
    // recovers.
    supervisor.stop().await.unwrap();
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.status().status, WorkerStatus::Running);

    supervisor.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The restart retired the crashed generation's watchers: the
    // remaining events are the restart and the stop, never a second
    // crash report.
    loop {
        match events.try_recv() {
            Ok(WorkerEvent::Crashed { .. }) => panic!("stale crash event after restart"),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn start_failure_reports_error_with_diagnostics() {
    let mut config = Config::for_worker("/nonexistent/worker-binary", 7714);
    config.start_timeout = Duration::from_millis(500);
    let supervisor = WorkerSupervisor::new(config);

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::StartFailed { .. }));
    assert_eq!(supervisor.status().status, WorkerStatus::Error);
}
