//! Loopback worker stub.
//!
//! Serves the worker surface for integration tests and local
//! development: health, entity generation, session registration, and a
//! token-at-a-time assist stream. Binds loopback only; the port comes
//! from the `PORT` environment variable set by the supervisor.
//!
//! Test hooks: a message containing `fail_mid` makes the assist stream
//! error after two tokens, `POST /exit` aborts the process to simulate
//! a crash, and `POST /shutdown` exits gracefully.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use wire_types::{
    AssistEvent, AssistRequest, CancelStreamRequest, CancelStreamResponse, CapabilityProfile,
    CompletionMetadata, CreateWorkerSessionRequest, CreateWorkerSessionResponse,
    GenerateEntityRequest, GeneratedEntity, HealthResponse,
};

const MODEL_NAME: &str = "stub";
const TOKEN_INTERVAL: Duration = Duration::from_millis(30);

struct AppState {
    sessions: DashMap<Uuid, CreateWorkerSessionRequest>,
    /// stream id → cancellation token for in-flight assist streams.
    streams: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("worker_stub=info")),
        )
        .init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "7700".to_string())
        .parse()?;

    let state = Arc::new(AppState {
        sessions: DashMap::new(),
        streams: DashMap::new(),
        shutdown: CancellationToken::new(),
    });
    let shutdown = state.shutdown.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/v1/entities/generate", post(generate_entity))
        .route("/v1/sessions", post(create_session))
        .route("/v1/assist", post(assist))
        .route("/v1/streams/{stream_id}/cancel", post(cancel_stream))
        .route("/shutdown", post(request_shutdown))
        .route("/exit", post(abort_process))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "worker stub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("worker stub exiting");
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

async fn generate_entity(
    Json(request): Json<GenerateEntityRequest>,
) -> Result<Json<GeneratedEntity>, (StatusCode, String)> {
    request
        .validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    Ok(Json(GeneratedEntity {
        name: request.name.clone(),
        kind: request.entity_type.clone(),
        content: format!(
            "# {} ({})\n{}\n",
            request.name, request.entity_type, request.description
        ),
        model: MODEL_NAME.to_string(),
    }))
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWorkerSessionRequest>,
) -> Json<CreateWorkerSessionResponse> {
    let session_id = Uuid::new_v4();
    let capability_profile = CapabilityProfile::all_enabled("stub", &request.active_tools);
    info!(%session_id, model = %request.model, "session registered");
    state.sessions.insert(session_id, request);

    Json(CreateWorkerSessionResponse {
        session_id,
        capability_profile,
        created_at: chrono::Utc::now(),
    })
}

async fn assist(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AssistRequest>,
) -> Result<Sse<KeepAliveStream<ReceiverStream<Result<Event, Infallible>>>>, (StatusCode, String)> {
    if !state.sessions.contains_key(&request.session_id) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("unknown session {}", request.session_id),
        ));
    }

    let cancel = CancellationToken::new();
    state.streams.insert(request.stream_id, cancel.clone());

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(run_assist_stream(state, request, cancel, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// Emits one token per word of the echoed reply, then a completion
/// marker. Stops early on cancellation or when the message asks for a
/// mid-stream failure.
async fn run_assist_stream(
    state: Arc<AppState>,
    request: AssistRequest,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let started = Instant::now();
    let fail_mid = request.content.contains("fail_mid");
    let reply = format!("echo: {}", request.content);
    let words: Vec<&str> = reply.split_whitespace().collect();

    let mut emitted = Vec::new();
    for (i, word) in words.iter().enumerate() {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(stream_id = %request.stream_id, "assist stream cancelled");
                state.streams.remove(&request.stream_id);
                return;
            }
            _ = tokio::time::sleep(TOKEN_INTERVAL) => {}
        }

        if fail_mid && i == 2 {
            let _ = send_event(
                &tx,
                &AssistEvent::Error {
                    message: "provider connection lost".into(),
                },
            )
            .await;
            state.streams.remove(&request.stream_id);
            return;
        }

        let token = if i == 0 {
            (*word).to_string()
        } else {
            format!(" {word}")
        };
        emitted.push(token.clone());
        if send_event(&tx, &AssistEvent::Token { token }).await.is_err() {
            // Client went away; nothing left to stream to.
            state.streams.remove(&request.stream_id);
            return;
        }
    }

    let full_content: String = emitted.concat();
    let complete = AssistEvent::Complete {
        full_content,
        metadata: CompletionMetadata {
            tokens_emitted: emitted.len() as u64,
            duration_ms: started.elapsed().as_millis() as u64,
            model: MODEL_NAME.to_string(),
        },
    };
    let _ = send_event(&tx, &complete).await;
    state.streams.remove(&request.stream_id);
}

async fn send_event(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    event: &AssistEvent,
) -> Result<(), ()> {
    let data = match serde_json::to_string(event) {
        Ok(data) => data,
        Err(e) => {
            warn!("failed to encode stream event: {e}");
            return Err(());
        }
    };
    tx.send(Ok(Event::default().data(data))).await.map_err(|_| ())
}

async fn cancel_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<Uuid>,
    Json(_request): Json<CancelStreamRequest>,
) -> Json<CancelStreamResponse> {
    let cancelled = match state.streams.remove(&stream_id) {
        Some((_, token)) => {
            token.cancel();
            true
        }
        None => false,
    };
    Json(CancelStreamResponse {
        stream_id,
        cancelled,
    })
}

async fn request_shutdown(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("shutdown requested");
    state.shutdown.cancel();
    StatusCode::OK
}

/// Crash hook: aborts without unwinding so the supervisor sees an
/// unexpected exit.
async fn abort_process() -> StatusCode {
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::process::exit(9);
    });
    StatusCode::OK
}
