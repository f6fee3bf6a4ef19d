//! Worker process supervisor.
//!
//! Owns the lifecycle of the single local worker process: spawn with a
//! deterministic loopback port, poll the health endpoint until ready,
//! watch for crashes while running, and shut down gracefully (with a
//! bounded grace period before a force kill).
//!
//! The process handle is a singleton owned by this struct; every state
//! transition goes through these methods and is announced on a
//! broadcast channel so dependents never poll shared mutable fields.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};
use wire_types::HealthResponse;

use crate::client::probe_health;
use crate::config::Config;
use crate::error::{ClientError, SupervisorError};

/// How many stderr lines are retained for start-failure diagnostics.
const STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Error,
    Stopping,
}

/// Snapshot of the supervised process.
///
/// Invariant: `base_address` is `Some` if and only if `status` is
/// `Running`. `pid` is present only while Running or Stopping.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHandle {
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub base_address: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkerHandle {
    fn stopped() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            pid: None,
            base_address: None,
            started_at: None,
            last_health_check_at: None,
            last_error: None,
        }
    }
}

/// Lifecycle transitions announced to dependent components.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started { base_address: String },
    /// Repeated health probe failures while Running.
    Unhealthy,
    /// The process exited while it was expected to be running.
    Crashed { exit_code: Option<i32> },
    Stopped,
}

pub struct WorkerSupervisor {
    config: Config,
    handle: StdMutex<WorkerHandle>,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    events: broadcast::Sender<WorkerEvent>,
    http: reqwest::Client,
    /// Serializes start/stop so exactly one lifecycle operation runs.
    lifecycle: Mutex<()>,
    /// Bumped on every transition in or out of Running; background
    /// tasks carry the generation they were spawned for and retire when
    /// it moves on.
    generation: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(config: Config) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            config,
            handle: StdMutex::new(WorkerHandle::stopped()),
            child: Mutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
            events,
            http: reqwest::Client::new(),
            lifecycle: Mutex::new(()),
            generation: AtomicU64::new(0),
        })
    }

    /// Start the worker process. No-op when already Running or Starting.
    ///
    /// Spawns the binary with the configured loopback port, then polls
    /// the health endpoint until it answers or the start timeout
    /// elapses. Exactly one OS process is spawned per successful call.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        {
            let handle = self.lock_handle();
            if matches!(
                handle.status,
                WorkerStatus::Running | WorkerStatus::Starting
            ) {
                return Ok(());
            }
        }

        let _lifecycle = self.lifecycle.lock().await;

        // Re-check under the lifecycle lock; a concurrent start may have
        // won the race.
        {
            let mut handle = self.lock_handle();
            if matches!(
                handle.status,
                WorkerStatus::Running | WorkerStatus::Starting
            ) {
                return Ok(());
            }
            handle.status = WorkerStatus::Starting;
            handle.pid = None;
            handle.base_address = None;
            handle.last_error = None;
        }
        // Retire any watcher still tracking a previous generation, so a
        // lingering old child exiting mid-start cannot broadcast a
        // crash for a process we already gave up on.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.lock_stderr_tail().clear();

        let mut child = match self.spawn_worker() {
            Ok(child) => child,
            Err(e) => {
                return Err(self.fail_start(format!("failed to spawn worker: {e}")));
            }
        };
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&self.stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = tail.lock().expect("stderr tail poisoned");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            });
        }

        let base_address = format!("http://127.0.0.1:{}", self.config.worker_port);
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(self.fail_start(format!(
                    "worker exited during startup (exit code {:?})",
                    status.code()
                )));
            }
            if probe_health(&self.http, &base_address, self.config.health_timeout)
                .await
                .is_ok()
            {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                child.kill().await.ok();
                return Err(self.fail_start(format!(
                    "worker did not become healthy within {:?}",
                    self.config.start_timeout
                )));
            }
            sleep(self.config.start_probe_interval).await;
        }

        *self.child.lock().await = Some(child);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut handle = self.lock_handle();
            handle.status = WorkerStatus::Running;
            handle.pid = pid;
            handle.base_address = Some(base_address.clone());
            handle.started_at = Some(Utc::now());
            handle.last_error = None;
        }

        tokio::spawn(Arc::clone(self).run_monitor(generation, base_address.clone()));
        tokio::spawn(Arc::clone(self).run_exit_watcher(generation));

        info!(pid, base_address = %base_address, "worker started");
        let _ = self.events.send(WorkerEvent::Started { base_address });
        Ok(())
    }

    /// Stop the worker process. No-op when already Stopped.
    ///
    /// Requests a graceful shutdown over loopback, waits out the grace
    /// period, then force-kills. The handle transitions to Stopped
    /// unconditionally once the process is confirmed gone.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let _lifecycle = self.lifecycle.lock().await;

        let child = self.child.lock().await.take();
        let base_address = {
            let mut handle = self.lock_handle();
            if handle.status == WorkerStatus::Stopped && child.is_none() {
                return Ok(());
            }
            let base = handle.base_address.take();
            handle.status = WorkerStatus::Stopping;
            base
        };
        // Retire the monitor and exit watcher before touching the child.
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(mut child) = child {
            if let Some(base) = base_address {
                // Best effort; the force kill below is the backstop.
                let _ = self
                    .http
                    .post(format!("{base}/shutdown"))
                    .timeout(self.config.health_timeout)
                    .send()
                    .await;
            }

            let deadline = tokio::time::Instant::now() + self.config.stop_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!(exit_code = ?status.code(), "worker exited gracefully");
                        break;
                    }
                    Ok(None) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("worker did not exit within grace period, killing");
                            child.kill().await.ok();
                            break;
                        }
                        sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => {
                        error!("failed to poll worker exit: {e}");
                        child.kill().await.ok();
                        break;
                    }
                }
            }
        }

        {
            let mut handle = self.lock_handle();
            handle.status = WorkerStatus::Stopped;
            handle.pid = None;
            handle.base_address = None;
        }
        let _ = self.events.send(WorkerEvent::Stopped);
        Ok(())
    }

    /// Snapshot of the process handle. Never blocks on async work.
    pub fn status(&self) -> WorkerHandle {
        self.lock_handle().clone()
    }

    /// Base address of the running worker, if any.
    pub fn base_address(&self) -> Option<String> {
        self.lock_handle().base_address.clone()
    }

    /// One health probe against the worker. Pure: does not mutate the
    /// handle, so a periodic monitor can distinguish a single failed
    /// probe from a process that is actually gone.
    pub async fn health_check(&self) -> Result<HealthResponse, ClientError> {
        let base = self
            .base_address()
            .ok_or_else(|| ClientError::Unreachable("worker is not running".into()))?;
        probe_health(&self.http, &base, self.config.health_timeout).await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    fn spawn_worker(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.config.worker_binary);
        command
            .env("PORT", self.config.worker_port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.worker_dir {
            command.current_dir(dir);
        }
        command.spawn()
    }

    fn fail_start(&self, reason: String) -> SupervisorError {
        error!("{reason}");
        {
            let mut handle = self.lock_handle();
            handle.status = WorkerStatus::Error;
            handle.pid = None;
            handle.base_address = None;
            handle.last_error = Some(reason.clone());
        }
        SupervisorError::StartFailed {
            reason,
            stderr_tail: self.stderr_tail(),
        }
    }

    /// The captured tail of the worker's stderr, newest last.
    pub fn stderr_tail(&self) -> String {
        let tail = self.lock_stderr_tail();
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Background task: periodic health probe while Running. Declares
    /// Error after the configured number of consecutive failures.
    async fn run_monitor(self: Arc<Self>, generation: u64, base_address: String) {
        let mut failures = 0u32;
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match probe_health(&self.http, &base_address, self.config.health_timeout).await {
                Ok(_) => {
                    failures = 0;
                    self.lock_handle().last_health_check_at = Some(Utc::now());
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, "worker health probe failed: {e}");
                    if failures >= self.config.monitor_failure_threshold {
                        // Retire the whole generation, exit watcher
                        // included, so the hung child's eventual exit is
                        // not reported as a fresh crash.
                        if self
                            .generation
                            .compare_exchange(
                                generation,
                                generation + 1,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            )
                            .is_ok()
                        {
                            self.mark_error(format!(
                                "{failures} consecutive health probes failed: {e}"
                            ));
                            let _ = self.events.send(WorkerEvent::Unhealthy);
                        }
                        return;
                    }
                }
            }
        }
    }

    /// Background task: watches the child process itself so an
    /// unexpected exit is detected immediately, without waiting for the
    /// health monitor to accumulate failures.
    async fn run_exit_watcher(self: Arc<Self>, generation: u64) {
        loop {
            sleep(self.config.exit_watch_interval).await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let exit_code = {
                let mut slot = self.child.lock().await;
                match slot.as_mut() {
                    // stop() took the child; nothing left to watch.
                    None => return,
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            slot.take();
                            Some(status.code())
                        }
                        Ok(None) => None,
                        Err(e) => {
                            warn!("failed to poll worker exit: {e}");
                            None
                        }
                    },
                }
            };
            if let Some(code) = exit_code {
                // Retire this generation only if no start/stop got there
                // first.
                if self
                    .generation
                    .compare_exchange(
                        generation,
                        generation + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    let err = SupervisorError::UnexpectedExit { code };
                    error!("{err}");
                    self.mark_error(err.to_string());
                    let _ = self.events.send(WorkerEvent::Crashed { exit_code: code });
                }
                return;
            }
        }
    }

    fn mark_error(&self, reason: String) {
        let mut handle = self.lock_handle();
        if handle.status == WorkerStatus::Running {
            handle.status = WorkerStatus::Error;
            handle.pid = None;
            handle.base_address = None;
            handle.last_error = Some(reason);
        }
    }

    /// Point the handle at an arbitrary address without spawning a
    /// process, so client tests can stand in their own server.
    #[cfg(test)]
    pub(crate) fn force_running(&self, base_address: String) {
        let mut handle = self.lock_handle();
        handle.status = WorkerStatus::Running;
        handle.base_address = Some(base_address);
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, WorkerHandle> {
        self.handle.lock().expect("worker handle poisoned")
    }

    fn lock_stderr_tail(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.stderr_tail.lock().expect("stderr tail poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_status_is_stopped() {
        let supervisor = WorkerSupervisor::new(Config::for_worker("/nonexistent", 7999));
        let handle = supervisor.status();
        assert_eq!(handle.status, WorkerStatus::Stopped);
        assert!(handle.pid.is_none());
        assert!(handle.base_address.is_none());
    }

    #[tokio::test]
    async fn stop_on_stopped_worker_is_a_noop() {
        let supervisor = WorkerSupervisor::new(Config::for_worker("/nonexistent", 7999));
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.status().status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn start_failure_surfaces_error_state() {
        let mut config = Config::for_worker("/nonexistent/worker-binary", 7999);
        config.start_timeout = Duration::from_millis(300);
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed { .. }));

        let handle = supervisor.status();
        assert_eq!(handle.status, WorkerStatus::Error);
        assert!(handle.base_address.is_none());
        assert!(handle.last_error.is_some());
    }

    #[tokio::test]
    async fn health_check_without_worker_is_unreachable() {
        let supervisor = WorkerSupervisor::new(Config::for_worker("/nonexistent", 7999));
        let err = supervisor.health_check().await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable(_)));
    }
}
