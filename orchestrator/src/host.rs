//! Host facade.
//!
//! Wires the supervisor, client, session manager, and tool orchestrator
//! together and spawns their background tasks. Embedders (a GUI shell,
//! a CLI) talk to [`WorkerHost`] and nothing else.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use wire_types::ProviderConfig;

use crate::client::{AssistStream, StreamHandle, WorkerClient};
use crate::config::Config;
use crate::credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
use crate::error::{ClientError, SessionError, SupervisorError, ToolError};
use crate::session::{Session, SessionManager};
use crate::supervisor::{WorkerHandle, WorkerSupervisor};
use crate::tools::{
    standard_tools, ApprovalPolicy, ManualApproval, ToolInvocation, ToolOrchestrator, ToolRegistry,
};

pub struct WorkerHost {
    supervisor: Arc<WorkerSupervisor>,
    client: Arc<WorkerClient>,
    sessions: Arc<SessionManager>,
    tools: Arc<ToolOrchestrator>,
}

impl WorkerHost {
    /// Wire the components and spawn their background tasks.
    pub fn new(
        config: Config,
        credentials: Arc<dyn CredentialStore>,
        registry: ToolRegistry,
        approval: Arc<dyn ApprovalPolicy>,
    ) -> Arc<Self> {
        let supervisor = WorkerSupervisor::new(config.clone());
        let client = WorkerClient::new(Arc::clone(&supervisor), &config);
        let sessions = SessionManager::new(
            Arc::clone(&supervisor),
            Arc::clone(&client),
            credentials,
            config,
        );
        let tools = ToolOrchestrator::new(registry, Arc::clone(&sessions), approval);

        tokio::spawn(Arc::clone(&sessions).run_worker_event_listener());
        tokio::spawn(Arc::clone(&sessions).run_closed_session_cleanup());

        Arc::new(Self {
            supervisor,
            client,
            sessions,
            tools,
        })
    }

    /// Stock wiring: the standard tool set rooted at the current
    /// directory, manual approval, and the file-backed credential store
    /// when the config names one.
    pub fn with_defaults(config: Config) -> anyhow::Result<Arc<Self>> {
        let credentials: Arc<dyn CredentialStore> = match &config.credentials_path {
            Some(path) => Arc::new(FileCredentialStore::new(path)),
            None => Arc::new(MemoryCredentialStore::new()),
        };
        let registry = ToolRegistry::with_tools(standard_tools(".", config.tool_timeout))?;
        Ok(Self::new(config, credentials, registry, Arc::new(ManualApproval)))
    }

    // ========================================================================
    // Worker lifecycle
    // ========================================================================

    pub async fn start_worker(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    pub async fn stop_worker(&self) -> Result<(), SupervisorError> {
        self.supervisor.stop().await
    }

    pub fn worker_status(&self) -> WorkerHandle {
        self.supervisor.status()
    }

    // ========================================================================
    // Sessions and streaming
    // ========================================================================

    pub async fn create_session(
        &self,
        provider_config: ProviderConfig,
        tools: Vec<String>,
        system_prompt: Option<String>,
    ) -> Result<Session, SessionError> {
        self.sessions
            .create_session(provider_config, tools, system_prompt)
            .await
    }

    pub async fn send_message(
        &self,
        session_id: Uuid,
        content: impl Into<String>,
    ) -> Result<AssistStream, SessionError> {
        self.sessions.send_message(session_id, content).await
    }

    pub async fn cancel_stream(&self, stream_id: Uuid) -> Result<(), ClientError> {
        self.client.cancel_stream(stream_id).await
    }

    pub fn stream_info(&self, stream_id: Uuid) -> Option<StreamHandle> {
        self.client.stream_info(stream_id)
    }

    pub async fn close_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        self.sessions.close_session(session_id).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<Session> {
        self.sessions.get_session(session_id).await
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.sessions.list_sessions().await
    }

    // ========================================================================
    // Tools
    // ========================================================================

    pub async fn execute_tool(
        &self,
        session_id: Uuid,
        tool_id: &str,
        params: Value,
    ) -> Result<ToolInvocation, ToolError> {
        self.tools.execute(session_id, tool_id, params).await
    }

    pub fn resolve_approval(&self, invocation_id: Uuid, approved: bool) -> Result<(), ToolError> {
        self.tools.resolve_approval(invocation_id, approved)
    }

    pub fn cancel_approval(&self, invocation_id: Uuid) -> Result<(), ToolError> {
        self.tools.cancel_approval(invocation_id)
    }

    pub fn pending_approvals(&self) -> Vec<Uuid> {
        self.tools.pending_approvals()
    }

    pub async fn telemetry(&self, session_id: Uuid) -> Vec<ToolInvocation> {
        self.tools.telemetry(session_id).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the worker before the host process exits. The supervisor's
    /// force kill is the backstop for a worker that ignores the graceful
    /// request.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        info!("shutting down worker host");
        self.supervisor.stop().await
    }
}
