//! Assistant session management.
//!
//! Each session binds one provider config (credentials resolved once,
//! at creation) to an append-only conversation history and a capability
//! set. The manager owns every session record; nothing else mutates
//! them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;
use wire_types::{
    AssistEvent, AssistRequest, CapabilityProfile, CreateWorkerSessionRequest, MessageMode,
    ProviderConfig, Role, Turn,
};

use crate::client::{AssistStream, WorkerClient};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{ClientError, SessionError};
use crate::supervisor::{WorkerEvent, WorkerStatus, WorkerSupervisor};

/// Default prompt for sessions created without one (same operator
/// contract the worker ships with).
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a guard-railed operator for context repository \
     pipelines. Confirm scope, execute only allowlisted commands, and summarize results for \
     humans.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Public snapshot of a session. History is append-only: turns are
/// never reordered or mutated after being appended.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub provider_config: ProviderConfig,
    pub system_prompt: String,
    pub active_tools: HashSet<String>,
    pub history: Vec<Turn>,
    pub status: SessionStatus,
    pub capability_profile: Option<CapabilityProfile>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

struct SessionRecord {
    session: Session,
    /// Stream id of the in-flight `send_message`, if any. At most one
    /// per session.
    in_flight: Option<Uuid>,
}

pub struct SessionManager {
    supervisor: Arc<WorkerSupervisor>,
    client: Arc<WorkerClient>,
    credentials: Arc<dyn CredentialStore>,
    sessions: Mutex<HashMap<Uuid, SessionRecord>>,
    config: Config,
}

impl SessionManager {
    pub fn new(
        supervisor: Arc<WorkerSupervisor>,
        client: Arc<WorkerClient>,
        credentials: Arc<dyn CredentialStore>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            client,
            credentials,
            sessions: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Create a session bound to `provider_config`.
    ///
    /// Validation happens before any network call; the credential
    /// reference is resolved exactly once, here, and the plaintext
    /// travels only in the loopback request body.
    pub async fn create_session(
        &self,
        provider_config: ProviderConfig,
        initial_capabilities: Vec<String>,
        system_prompt: Option<String>,
    ) -> Result<Session, SessionError> {
        provider_config
            .validate()
            .map_err(|e| SessionError::ConfigInvalid(e.to_string()))?;

        self.ensure_worker_running().await?;

        let api_key = match provider_config.credential_ref.as_deref() {
            Some(credential_ref) => {
                let secret = self.credentials.resolve(credential_ref).await.ok_or_else(|| {
                    SessionError::ConfigInvalid(format!(
                        "credential reference '{credential_ref}' could not be resolved"
                    ))
                })?;
                Some(secret.expose().to_string())
            }
            None => None,
        };

        let system_prompt = system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let request = CreateWorkerSessionRequest {
            provider: provider_config.provider,
            endpoint: provider_config.endpoint.clone(),
            model: provider_config.model.clone(),
            api_key,
            system_prompt: Some(system_prompt.clone()),
            temperature: provider_config.temperature,
            max_tokens: provider_config.max_tokens,
            active_tools: initial_capabilities.clone(),
        };

        let response = self
            .with_retry(|| self.client.create_session(&request))
            .await?;

        let session = Session {
            id: response.session_id,
            provider_config,
            system_prompt,
            active_tools: initial_capabilities.into_iter().collect(),
            history: Vec::new(),
            status: SessionStatus::Active,
            capability_profile: Some(response.capability_profile),
            created_at: response.created_at,
            closed_at: None,
        };

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            session.id,
            SessionRecord {
                session: session.clone(),
                in_flight: None,
            },
        );
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Send a user message and stream back the assistant's response.
    ///
    /// The user turn is appended immediately. The assistant turn is
    /// appended only when the stream completes; a failed or cancelled
    /// stream leaves the session with just the user turn recorded, so a
    /// retry resends the same context.
    pub async fn send_message(
        self: &Arc<Self>,
        session_id: Uuid,
        content: impl Into<String>,
    ) -> Result<AssistStream, SessionError> {
        let content = content.into();
        let stream_id = Uuid::new_v4();

        let history = {
            let mut sessions = self.sessions.lock().await;
            let record = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            if record.session.status == SessionStatus::Closed {
                return Err(SessionError::Closed(session_id));
            }
            if record.in_flight.is_some() {
                return Err(SessionError::StreamInProgress(session_id));
            }
            record
                .session
                .history
                .push(Turn::new(Role::User, content.clone()));
            record.in_flight = Some(stream_id);
            record.session.history.clone()
        };

        let request = AssistRequest {
            stream_id,
            session_id,
            content,
            mode: MessageMode::General,
            history,
        };

        let upstream = match self
            .with_retry(|| self.client.stream_assist(request.clone()))
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                let mut sessions = self.sessions.lock().await;
                if let Some(record) = sessions.get_mut(&session_id) {
                    if record.in_flight == Some(stream_id) {
                        record.in_flight = None;
                    }
                }
                return Err(e.into());
            }
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(Arc::clone(self).relay_stream(session_id, stream_id, upstream, tx));
        Ok(AssistStream::new(stream_id, rx))
    }

    /// Close a session. Idempotent; cancels any open stream.
    pub async fn close_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        let open_stream = {
            let mut sessions = self.sessions.lock().await;
            let record = sessions
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            if record.session.status == SessionStatus::Closed {
                return Ok(());
            }
            record.session.status = SessionStatus::Closed;
            record.session.closed_at = Some(Utc::now());
            record.in_flight.take()
        };

        if let Some(stream_id) = open_stream {
            if let Err(e) = self.client.cancel_stream(stream_id).await {
                warn!(%session_id, %stream_id, "failed to cancel stream on close: {e}");
            }
        }
        info!(%session_id, "session closed");
        Ok(())
    }

    /// Snapshot of one session.
    pub async fn get_session(&self, session_id: Uuid) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.get(&session_id).map(|r| r.session.clone())
    }

    /// Snapshots of all retained sessions, including recently closed
    /// ones awaiting eviction.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|r| r.session.clone()).collect()
    }

    /// Allow-list of tool ids the session may invoke. Read by the tool
    /// orchestrator; only the manager mutates session state.
    pub async fn active_tools(&self, session_id: Uuid) -> Result<HashSet<String>, SessionError> {
        let sessions = self.sessions.lock().await;
        let record = sessions
            .get(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        Ok(record.session.active_tools.clone())
    }

    /// Background task: evict Closed sessions once their retention
    /// window lapses.
    pub async fn run_closed_session_cleanup(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.session_cleanup_interval);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            let retention = self.config.closed_session_retention;
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|session_id, record| {
                let evict = record.session.status == SessionStatus::Closed
                    && record
                        .session
                        .closed_at
                        .map(|t| Utc::now() - t > chrono::Duration::from_std(retention).unwrap_or_default())
                        .unwrap_or(false);
                if evict {
                    info!(%session_id, "evicting closed session");
                }
                !evict
            });
        }
    }

    /// Background task: react to worker lifecycle events. A dead worker
    /// is fatal to every open stream; consumers are notified instead of
    /// being left to idle out.
    pub async fn run_worker_event_listener(self: Arc<Self>) {
        let mut events = self.supervisor.subscribe();
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Crashed { exit_code }) => {
                    self.fail_in_flight(&format!(
                        "worker exited unexpectedly (exit code {exit_code:?})"
                    ))
                    .await;
                }
                Ok(WorkerEvent::Unhealthy) => {
                    self.fail_in_flight("worker stopped responding to health probes")
                        .await;
                }
                Ok(WorkerEvent::Stopped) => {
                    self.fail_in_flight("worker was stopped").await;
                }
                Ok(WorkerEvent::Started { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "worker event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn fail_in_flight(&self, reason: &str) {
        self.client.fail_open_streams(reason).await;
        let mut sessions = self.sessions.lock().await;
        for record in sessions.values_mut() {
            record.in_flight = None;
        }
    }

    async fn relay_stream(
        self: Arc<Self>,
        session_id: Uuid,
        stream_id: Uuid,
        mut upstream: AssistStream,
        tx: mpsc::Sender<AssistEvent>,
    ) {
        let mut completion: Option<String> = None;
        while let Some(event) = upstream.next_event().await {
            if let AssistEvent::Complete { full_content, .. } = &event {
                completion = Some(full_content.clone());
            }
            let terminal = event.is_terminal();
            // Keep draining upstream even if the caller dropped the
            // receiver, so the session still settles.
            let _ = tx.send(event).await;
            if terminal {
                break;
            }
        }

        let mut sessions = self.sessions.lock().await;
        let Some(record) = sessions.get_mut(&session_id) else {
            return;
        };
        if record.in_flight == Some(stream_id) {
            record.in_flight = None;
        }
        if let Some(full_content) = completion {
            record
                .session
                .history
                .push(Turn::new(Role::Assistant, full_content));
        }
    }

    /// Ensure the supervisor reports Running: start a Stopped worker,
    /// fail fast when it is in Error, ride out a transition already in
    /// progress.
    async fn ensure_worker_running(&self) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + self.config.start_timeout;
        loop {
            let handle = self.supervisor.status();
            match handle.status {
                WorkerStatus::Running => return Ok(()),
                WorkerStatus::Stopped => {
                    self.supervisor
                        .start()
                        .await
                        .map_err(|e| SessionError::WorkerUnavailable(e.to_string()))?;
                }
                WorkerStatus::Error => {
                    return Err(SessionError::WorkerUnavailable(
                        handle
                            .last_error
                            .unwrap_or_else(|| "worker is in an error state".into()),
                    ));
                }
                WorkerStatus::Starting | WorkerStatus::Stopping => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SessionError::WorkerUnavailable(
                            "worker stuck in a lifecycle transition".into(),
                        ));
                    }
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One local retry for transport failures, after re-confirming
    /// worker health. A second failure surfaces unmodified. Capability
    /// and validation failures are never retried.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        match op().await {
            Err(first @ ClientError::Unreachable(_)) => {
                if self.supervisor.health_check().await.is_ok() {
                    op().await
                } else {
                    Err(first)
                }
            }
            other => other,
        }
    }
}
