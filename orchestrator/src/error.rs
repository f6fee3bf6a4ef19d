//! Error taxonomies for the orchestration layer.
//!
//! One enum per component. Library code propagates these with `?`;
//! binaries collapse them into `anyhow` at the boundary.

use uuid::Uuid;

/// Worker process lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The worker never became healthy within the start timeout, or the
    /// spawn itself failed. Carries the captured stderr tail.
    #[error("worker failed to start: {reason}")]
    StartFailed { reason: String, stderr_tail: String },

    /// The worker exited while it was expected to be running.
    #[error("worker exited unexpectedly (exit code {code:?})")]
    UnexpectedExit { code: Option<i32> },
}

/// Loopback transport and protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection refused or dropped. Never interpreted as an empty
    /// result.
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    /// The request deadline elapsed.
    #[error("worker request timed out")]
    Timeout,

    /// The request failed its own schema before being sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The worker answered, but the payload failed schema validation.
    #[error("invalid worker response: {0}")]
    InvalidResponse(String),

    /// Non-success HTTP status from the worker.
    #[error("worker returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// A second stream was requested while one is already open for the
    /// session.
    #[error("session {session_id} already has an open stream")]
    StreamAlreadyOpen { session_id: Uuid },

    /// Cancellation named a stream the registry does not know.
    #[error("unknown stream {0}")]
    UnknownStream(Uuid),
}

impl ClientError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() || err.is_request() {
            ClientError::Unreachable(err.to_string())
        } else {
            ClientError::InvalidResponse(err.to_string())
        }
    }
}

/// Session lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The worker is in an error state or could not be started.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The provider config failed local validation. Raised before any
    /// network call.
    #[error("invalid provider config: {0}")]
    ConfigInvalid(String),

    /// A message is already streaming on this session.
    #[error("a stream is already in progress for session {0}")]
    StreamInProgress(Uuid),

    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("session {0} is closed")]
    Closed(Uuid),

    /// Transport failure that survived the single local retry.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Tool execution failures.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool is not in the session's capability allow-list. Terminal;
    /// never retried.
    #[error("tool '{tool_id}' is not in the session's active tools")]
    CapabilityDenied { tool_id: String },

    /// Parameters failed the tool's declared schema. Raised before
    /// execution.
    #[error("invalid parameters for '{tool_id}': {reason}")]
    InvalidParameters { tool_id: String, reason: String },

    /// The approval decision was negative or the wait was cancelled.
    /// Terminal.
    #[error("tool invocation was not approved")]
    NotApproved,

    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("tool '{tool_id}' timed out after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },

    #[error("no tool registered under id '{0}'")]
    UnknownTool(String),

    #[error("no pending approval for invocation {0}")]
    UnknownInvocation(Uuid),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),
}
