//! Host-side orchestration for a local worker process.
//!
//! The worker is a separately-built loopback HTTP server; this crate
//! owns its lifecycle and everything layered on top:
//!
//! - [`supervisor`] — spawn, readiness probing, crash detection, and
//!   graceful shutdown of the worker process.
//! - [`client`] — typed calls over the loopback API, including
//!   cancellable token streaming.
//! - [`session`] — provider-bound assistant sessions with append-only
//!   history.
//! - [`tools`] — capability-gated, approval-gated tool invocation with
//!   an append-only telemetry log.
//! - [`host`] — the facade embedders use.

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod host;
pub mod session;
pub mod supervisor;
pub mod tools;

pub use client::{AssistStream, StreamHandle, StreamStatus, WorkerClient};
pub use config::Config;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore, Secret};
pub use error::{ClientError, SessionError, SupervisorError, ToolError};
pub use host::WorkerHost;
pub use session::{Session, SessionManager, SessionStatus, DEFAULT_SYSTEM_PROMPT};
pub use supervisor::{WorkerEvent, WorkerHandle, WorkerStatus, WorkerSupervisor};
pub use tools::{
    ApprovalPolicy, AutoApprove, InvocationStatus, InvocationTelemetry, ManualApproval,
    ToolInvocation, ToolOrchestrator, ToolRegistry, ToolSpec,
};
