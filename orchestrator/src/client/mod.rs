//! Typed client over the worker's loopback API.
//!
//! Single request/response calls are schema-validated on both sides of
//! the wire; the streaming-assist call hands back a channel-backed
//! [`AssistStream`]. Transport failures always surface as
//! [`ClientError::Unreachable`], never as an empty success.

mod stream;

pub use stream::{AssistStream, StreamHandle, StreamStatus};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;
use wire_types::{
    AssistRequest, CancelStreamRequest, CreateWorkerSessionRequest, CreateWorkerSessionResponse,
    GenerateEntityRequest, GeneratedEntity, HealthResponse,
};

use crate::config::Config;
use crate::error::ClientError;
use crate::supervisor::WorkerSupervisor;

use stream::StreamEntry;

/// Channel capacity between a stream producer and its consumer. Small
/// on purpose: a slow consumer backpressures the transport read.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One health probe against `base_address`. Shared with the supervisor,
/// whose readiness poll and background monitor are thin wrappers over
/// this.
pub async fn probe_health(
    http: &reqwest::Client,
    base_address: &str,
    timeout: Duration,
) -> Result<HealthResponse, ClientError> {
    let response = http
        .get(format!("{base_address}/health"))
        .timeout(timeout)
        .send()
        .await
        .map_err(ClientError::from_reqwest)?;
    if !response.status().is_success() {
        return Err(ClientError::Status {
            status: response.status().as_u16(),
            message: "health endpoint returned non-success".into(),
        });
    }
    response
        .json::<HealthResponse>()
        .await
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))
}

pub struct WorkerClient {
    supervisor: Arc<WorkerSupervisor>,
    http: reqwest::Client,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
    health_timeout: Duration,
    streams: DashMap<Uuid, Arc<StreamEntry>>,
    /// session id → currently open stream id. At most one open stream
    /// per session.
    open_by_session: Arc<DashMap<Uuid, Uuid>>,
}

impl WorkerClient {
    pub fn new(supervisor: Arc<WorkerSupervisor>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            http: reqwest::Client::new(),
            request_timeout: config.request_timeout,
            stream_idle_timeout: config.stream_idle_timeout,
            health_timeout: config.health_timeout,
            streams: DashMap::new(),
            open_by_session: Arc::new(DashMap::new()),
        })
    }

    fn base_address(&self) -> Result<String, ClientError> {
        self.supervisor
            .base_address()
            .ok_or_else(|| ClientError::Unreachable("worker is not running".into()))
    }

    /// Thin health wrapper used by the supervisor's monitor and the
    /// session manager's retry path.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let base = self.base_address()?;
        probe_health(&self.http, &base, self.health_timeout).await
    }

    /// Single request/response entity generation. The response is
    /// validated before being accepted; a payload failing validation is
    /// an [`ClientError::InvalidResponse`], never coerced.
    pub async fn generate_entity(
        &self,
        request: &GenerateEntityRequest,
    ) -> Result<GeneratedEntity, ClientError> {
        request
            .validate()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        let base = self.base_address()?;

        let response = self
            .http
            .post(format!("{base}/v1/entities/generate"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = check_status(response).await?;

        let entity: GeneratedEntity = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        entity
            .validate()
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(entity)
    }

    /// Register a session on the worker. The request body is the only
    /// place the resolved plaintext credential travels.
    pub async fn create_session(
        &self,
        request: &CreateWorkerSessionRequest,
    ) -> Result<CreateWorkerSessionResponse, ClientError> {
        let base = self.base_address()?;
        let response = self
            .http
            .post(format!("{base}/v1/sessions"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Open a streaming-assist call. The returned sequence is finite,
    /// terminated by a completion or error marker, and not restartable.
    pub async fn stream_assist(&self, request: AssistRequest) -> Result<AssistStream, ClientError> {
        let base = self.base_address()?;

        match self.open_by_session.entry(request.session_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ClientError::StreamAlreadyOpen {
                    session_id: request.session_id,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(request.stream_id);
            }
        }

        // Hard deadline on connecting and waiting for response headers;
        // the body itself is governed by the idle timeout instead, since
        // a healthy stream can legitimately outlive any fixed deadline.
        let send = self
            .http
            .post(format!("{base}/v1/assist"))
            .json(&request)
            .send();
        let response = match tokio::time::timeout(self.request_timeout, send).await {
            Err(_) => {
                self.open_by_session.remove(&request.session_id);
                return Err(ClientError::Timeout);
            }
            Ok(Err(e)) => {
                self.open_by_session.remove(&request.session_id);
                return Err(ClientError::from_reqwest(e));
            }
            Ok(Ok(response)) => response,
        };
        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                self.open_by_session.remove(&request.session_id);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let entry = StreamEntry::new(request.stream_id, request.session_id, tx.clone());
        self.streams.insert(request.stream_id, Arc::clone(&entry));

        tokio::spawn(stream::pump_stream(
            entry,
            tx,
            Box::pin(response.bytes_stream()),
            self.stream_idle_timeout,
            Arc::clone(&self.open_by_session),
        ));

        Ok(AssistStream::new(request.stream_id, rx))
    }

    /// Signal an in-flight stream to stop. No further tokens are
    /// delivered once cancellation is acknowledged; the consumer may
    /// drain the remaining buffered events or simply drop the receiver.
    pub async fn cancel_stream(&self, stream_id: Uuid) -> Result<(), ClientError> {
        let entry = self
            .streams
            .get(&stream_id)
            .map(|e| Arc::clone(&e))
            .ok_or(ClientError::UnknownStream(stream_id))?;

        entry.mark_cancel_requested();
        entry.cancel.cancel();

        // Tell the worker too, so the request is not left running
        // against the provider. Best effort; dropping our connection is
        // the hard backstop.
        if let Ok(base) = self.base_address() {
            let result = self
                .http
                .post(format!("{base}/v1/streams/{stream_id}/cancel"))
                .timeout(self.health_timeout)
                .json(&CancelStreamRequest { stream_id })
                .send()
                .await;
            if let Err(e) = result {
                warn!(%stream_id, "worker cancel request failed: {e}");
            }
        }
        Ok(())
    }

    /// Snapshot of one stream handle.
    pub fn stream_info(&self, stream_id: Uuid) -> Option<StreamHandle> {
        self.streams.get(&stream_id).map(|e| e.snapshot())
    }

    /// Fail every open stream, notifying consumers instead of letting
    /// them idle out. Called when the worker process dies.
    pub async fn fail_open_streams(&self, reason: &str) {
        let open: Vec<Arc<StreamEntry>> = self
            .streams
            .iter()
            .filter(|e| e.snapshot().status == StreamStatus::Open)
            .map(|e| Arc::clone(&e))
            .collect();

        for entry in open {
            entry.finish(StreamStatus::Failed);
            entry.cancel.cancel();
            entry.notify_error(reason.to_string()).await;
        }
        self.open_by_session.clear();
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::WorkerSupervisor;

    fn offline_client() -> Arc<WorkerClient> {
        let config = Config::for_worker("/nonexistent", 7998);
        let supervisor = WorkerSupervisor::new(config.clone());
        WorkerClient::new(supervisor, &config)
    }

    #[tokio::test]
    async fn calls_without_running_worker_are_unreachable() {
        let client = offline_client();

        let err = client.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable(_)));

        let request = GenerateEntityRequest {
            entity_type: "schema".into(),
            name: "Order".into(),
            description: String::new(),
            attributes: Default::default(),
        };
        let err = client.generate_entity(&request).await.unwrap_err();
        assert!(matches!(err, ClientError::Unreachable(_)));
    }

    #[tokio::test]
    async fn invalid_generate_request_fails_before_send() {
        let client = offline_client();
        let request = GenerateEntityRequest {
            entity_type: String::new(),
            name: "Order".into(),
            description: String::new(),
            attributes: Default::default(),
        };
        let err = client.generate_entity(&request).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn cancelling_unknown_stream_errors() {
        let client = offline_client();
        let err = client.cancel_stream(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ClientError::UnknownStream(_)));
    }

    #[tokio::test]
    async fn assist_header_wait_hits_a_hard_deadline() {
        // A server that accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let _hold = socket;
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                });
            }
        });

        let mut config = Config::for_worker("/nonexistent", 7996);
        config.request_timeout = std::time::Duration::from_millis(200);
        let supervisor = WorkerSupervisor::new(config.clone());
        supervisor.force_running(format!("http://{addr}"));
        let client = WorkerClient::new(supervisor, &config);

        let request = wire_types::AssistRequest {
            stream_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            content: "hello".into(),
            mode: Default::default(),
            history: vec![],
        };
        let err = client.stream_assist(request.clone()).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));

        // The per-session slot is released on the timeout path, so the
        // next attempt is not misreported as an already-open stream.
        let err = client.stream_assist(request).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }
}
