//! Tool invocation orchestration.
//!
//! Every invocation flows through the same pipeline: capability check,
//! parameter validation, approval gate, execution with a deadline. Each
//! stage that fails is recorded; the telemetry log is append-only and
//! keeps rejected and failed invocations alongside successes.

pub mod registry;

pub use registry::{
    context_read_schema, standard_tools, ContextReadOp, ParamField, ParamKind, ParamsSchema,
    ToolOp, ToolRegistry, ToolSpec, UnwiredOp,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::session::SessionManager;

/// Lifecycle of one invocation. Transitions are forward-only; a record
/// never moves back to an earlier status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Approved,
    Executing,
    Succeeded,
    Failed,
    Rejected,
}

/// Timing and outcome facts for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationTelemetry {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Human-readable outcome: result summary, rejection reason, or
    /// error text. Never carries credentials.
    pub outcome: String,
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub tool_id: String,
    pub parameters: Value,
    pub requires_approval: bool,
    pub status: InvocationStatus,
    pub result: Option<Value>,
    pub telemetry: InvocationTelemetry,
}

impl ToolInvocation {
    fn new(session_id: Uuid, tool_id: &str, parameters: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            tool_id: tool_id.to_string(),
            parameters,
            requires_approval: false,
            status: InvocationStatus::Pending,
            result: None,
            telemetry: InvocationTelemetry {
                started_at: Utc::now(),
                finished_at: None,
                duration_ms: None,
                outcome: String::new(),
            },
        }
    }

    fn settle(&mut self, status: InvocationStatus, outcome: impl Into<String>) {
        let finished = Utc::now();
        self.status = status;
        self.telemetry.outcome = outcome.into();
        self.telemetry.finished_at = Some(finished);
        self.telemetry.duration_ms = Some(
            (finished - self.telemetry.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
    }
}

/// Decision hook for invocations whose tool requires approval. The
/// default [`AutoApprove`] policy answers immediately; an interactive
/// embedder installs [`ManualApproval`] and resolves decisions itself.
pub trait ApprovalPolicy: Send + Sync {
    /// Called when an invocation starts waiting. Returning `Some`
    /// decides immediately; `None` leaves the invocation pending until
    /// [`ToolOrchestrator::resolve_approval`] is called.
    fn decide(&self, invocation: &ToolInvocation) -> Option<bool>;
}

/// Approves everything. Suitable for trusted, non-interactive hosts.
pub struct AutoApprove;

impl ApprovalPolicy for AutoApprove {
    fn decide(&self, _invocation: &ToolInvocation) -> Option<bool> {
        Some(true)
    }
}

/// Defers every decision to an external caller.
pub struct ManualApproval;

impl ApprovalPolicy for ManualApproval {
    fn decide(&self, _invocation: &ToolInvocation) -> Option<bool> {
        None
    }
}

pub struct ToolOrchestrator {
    registry: ToolRegistry,
    sessions: Arc<SessionManager>,
    approval: Arc<dyn ApprovalPolicy>,
    /// invocation id → decision channel for invocations waiting on
    /// approval.
    pending: DashMap<Uuid, oneshot::Sender<bool>>,
    /// session id → append-only invocation log.
    log: Mutex<HashMap<Uuid, Vec<ToolInvocation>>>,
}

impl ToolOrchestrator {
    pub fn new(
        registry: ToolRegistry,
        sessions: Arc<SessionManager>,
        approval: Arc<dyn ApprovalPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions,
            approval,
            pending: DashMap::new(),
            log: Mutex::new(HashMap::new()),
        })
    }

    /// Every tool id the registry knows, independent of any session's
    /// allow-list.
    pub fn registered_tools(&self) -> Vec<String> {
        self.registry.tool_ids()
    }

    /// Run one tool invocation through the full pipeline on behalf of
    /// `session_id`.
    ///
    /// Denials, rejections, failures, and timeouts are all recorded in
    /// the telemetry log before the error is returned; a capability
    /// denial is terminal and never retried internally.
    pub async fn execute(
        &self,
        session_id: Uuid,
        tool_id: &str,
        params: Value,
    ) -> Result<ToolInvocation, ToolError> {
        let active = self
            .sessions
            .active_tools(session_id)
            .await
            .map_err(|_| ToolError::SessionNotFound(session_id))?;

        // Appended before any gate runs, so the log reads in invocation
        // order regardless of how long each invocation takes to settle.
        let mut invocation = ToolInvocation::new(session_id, tool_id, params.clone());
        self.append(&invocation).await;

        // Capability gate comes first: an unlisted tool is denied even
        // when the id is unknown to the registry, so probing the
        // registry through a restricted session tells you nothing.
        if !active.contains(tool_id) {
            invocation.settle(
                InvocationStatus::Rejected,
                "tool is not in the session's active tools",
            );
            self.update(&invocation).await;
            return Err(ToolError::CapabilityDenied {
                tool_id: tool_id.to_string(),
            });
        }

        let spec = match self.registry.get(tool_id) {
            Some(spec) => spec.clone(),
            None => {
                invocation.settle(InvocationStatus::Rejected, "tool is not registered");
                self.update(&invocation).await;
                return Err(ToolError::UnknownTool(tool_id.to_string()));
            }
        };
        invocation.requires_approval = spec.requires_approval;
        self.update(&invocation).await;

        if let Err(reason) = spec.params.validate(&params) {
            invocation.settle(InvocationStatus::Failed, format!("invalid parameters: {reason}"));
            self.update(&invocation).await;
            return Err(ToolError::InvalidParameters {
                tool_id: tool_id.to_string(),
                reason,
            });
        }

        if spec.requires_approval {
            match self.approval.decide(&invocation) {
                Some(true) => {
                    invocation.status = InvocationStatus::Approved;
                }
                Some(false) => {
                    invocation.settle(InvocationStatus::Rejected, "approval denied");
                    self.update(&invocation).await;
                    return Err(ToolError::NotApproved);
                }
                None => {
                    if self.await_approval(&mut invocation).await {
                        invocation.status = InvocationStatus::Approved;
                    } else {
                        invocation.settle(InvocationStatus::Rejected, "approval denied");
                        self.update(&invocation).await;
                        return Err(ToolError::NotApproved);
                    }
                }
            }
        }

        invocation.status = InvocationStatus::Executing;
        self.update(&invocation).await;
        info!(invocation_id = %invocation.id, %session_id, tool_id, "executing tool");

        let run = tokio::time::timeout(spec.timeout, spec.op.run(&params)).await;
        match run {
            Ok(Ok(result)) => {
                invocation.result = Some(result);
                invocation.settle(InvocationStatus::Succeeded, "ok");
                self.update(&invocation).await;
                Ok(invocation)
            }
            Ok(Err(e)) => {
                warn!(invocation_id = %invocation.id, tool_id, "tool failed: {e}");
                invocation.settle(InvocationStatus::Failed, e.to_string());
                self.update(&invocation).await;
                Err(ToolError::ExecutionFailed(e.to_string()))
            }
            Err(_) => {
                let timeout_ms = spec.timeout.as_millis() as u64;
                warn!(invocation_id = %invocation.id, tool_id, timeout_ms, "tool timed out");
                invocation.settle(
                    InvocationStatus::Failed,
                    format!("timed out after {timeout_ms}ms"),
                );
                self.update(&invocation).await;
                Err(ToolError::Timeout {
                    tool_id: tool_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Decide a pending invocation. `approved == false` rejects it.
    pub fn resolve_approval(&self, invocation_id: Uuid, approved: bool) -> Result<(), ToolError> {
        let (_, sender) = self
            .pending
            .remove(&invocation_id)
            .ok_or(ToolError::UnknownInvocation(invocation_id))?;
        // The waiter may have been dropped; a send failure is the same
        // outcome as a rejection and needs no handling here.
        let _ = sender.send(approved);
        Ok(())
    }

    /// Withdraw a pending invocation without deciding it. The waiter
    /// observes a rejection.
    pub fn cancel_approval(&self, invocation_id: Uuid) -> Result<(), ToolError> {
        self.pending
            .remove(&invocation_id)
            .ok_or(ToolError::UnknownInvocation(invocation_id))?;
        Ok(())
    }

    /// Invocation ids currently blocked on an approval decision.
    pub fn pending_approvals(&self) -> Vec<Uuid> {
        self.pending.iter().map(|e| *e.key()).collect()
    }

    /// Append-only invocation log for one session, in invocation order.
    /// An invocation still in flight appears with its current status.
    pub async fn telemetry(&self, session_id: Uuid) -> Vec<ToolInvocation> {
        let log = self.log.lock().await;
        log.get(&session_id).cloned().unwrap_or_default()
    }

    async fn await_approval(&self, invocation: &mut ToolInvocation) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(invocation.id, tx);
        info!(invocation_id = %invocation.id, tool_id = %invocation.tool_id, "awaiting approval");
        // A dropped sender (cancel_approval, or orchestrator teardown)
        // reads as rejection.
        let approved = rx.await.unwrap_or(false);
        self.pending.remove(&invocation.id);
        approved
    }

    async fn append(&self, invocation: &ToolInvocation) {
        let mut log = self.log.lock().await;
        log.entry(invocation.session_id)
            .or_default()
            .push(invocation.clone());
    }

    /// Rewrite an invocation's log slot in place. The slot was claimed
    /// at creation time, so later updates never reorder the log.
    async fn update(&self, invocation: &ToolInvocation) {
        let mut log = self.log.lock().await;
        if let Some(records) = log.get_mut(&invocation.session_id) {
            if let Some(slot) = records.iter_mut().find(|r| r.id == invocation.id) {
                *slot = invocation.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    struct CountingOp {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolOp for CountingOp {
        async fn run(&self, _params: &Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
    }

    #[test]
    fn settle_is_forward_only_in_shape() {
        let mut invocation = ToolInvocation::new(Uuid::new_v4(), "context.read", json!({}));
        assert_eq!(invocation.status, InvocationStatus::Pending);
        invocation.settle(InvocationStatus::Succeeded, "ok");
        assert_eq!(invocation.status, InvocationStatus::Succeeded);
        assert!(invocation.telemetry.finished_at.is_some());
        assert!(invocation.telemetry.duration_ms.is_some());
    }

    #[test]
    fn auto_approve_always_approves() {
        let invocation = ToolInvocation::new(Uuid::new_v4(), "pipeline.build-graph", json!({}));
        assert_eq!(AutoApprove.decide(&invocation), Some(true));
        assert_eq!(ManualApproval.decide(&invocation), None);
    }

    #[tokio::test]
    async fn counting_op_runs_under_timeout() {
        let op = CountingOp {
            calls: AtomicUsize::new(0),
        };
        let result = tokio::time::timeout(Duration::from_secs(1), op.run(&json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }
}
