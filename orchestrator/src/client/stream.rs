//! Channel-backed assist streams.
//!
//! The producer task reads the worker's event-stream response, parses
//! it into [`AssistEvent`]s, and writes them into a bounded mpsc
//! channel; the consumer reads from the channel with backpressure.
//! Cancellation and idle timeouts live here, visible in the types
//! rather than buried in callbacks.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wire_types::AssistEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Open,
    Completed,
    Cancelled,
    Failed,
}

/// Snapshot of one in-flight (or finished) streaming response.
#[derive(Debug, Clone, Serialize)]
pub struct StreamHandle {
    pub id: Uuid,
    pub session_id: Uuid,
    pub cancel_requested: bool,
    pub tokens_emitted: u64,
    pub status: StreamStatus,
}

/// Registry entry backing a [`StreamHandle`].
pub(crate) struct StreamEntry {
    info: StdMutex<StreamHandle>,
    pub(crate) cancel: CancellationToken,
    /// Clone of the producer-side sender, so a crash notification can
    /// reach the consumer even when the producer is stuck on a dead
    /// connection. Dropped once the stream settles; the consumer's
    /// channel closes only when this and the producer's sender are both
    /// gone.
    notify: StdMutex<Option<mpsc::Sender<AssistEvent>>>,
}

impl StreamEntry {
    pub(crate) fn new(
        id: Uuid,
        session_id: Uuid,
        notify: mpsc::Sender<AssistEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: StdMutex::new(StreamHandle {
                id,
                session_id,
                cancel_requested: false,
                tokens_emitted: 0,
                status: StreamStatus::Open,
            }),
            cancel: CancellationToken::new(),
            notify: StdMutex::new(Some(notify)),
        })
    }

    /// Push an out-of-band error to the consumer and drop the retained
    /// sender. Used when the worker process dies under an open stream.
    pub(crate) async fn notify_error(&self, message: String) {
        let sender = self
            .notify
            .lock()
            .expect("stream notify poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(AssistEvent::Error { message }).await;
        }
    }

    /// Drop the retained sender so the consumer channel can close.
    pub(crate) fn close_notify(&self) {
        self.notify
            .lock()
            .expect("stream notify poisoned")
            .take();
    }

    pub(crate) fn snapshot(&self) -> StreamHandle {
        self.lock().clone()
    }

    pub(crate) fn mark_cancel_requested(&self) {
        self.lock().cancel_requested = true;
    }

    fn bump_tokens(&self) {
        self.lock().tokens_emitted += 1;
    }

    /// Transition out of Open. Later transitions are ignored; a stream
    /// finishes exactly once.
    pub(crate) fn finish(&self, status: StreamStatus) {
        let mut info = self.lock();
        if info.status == StreamStatus::Open {
            info.status = status;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamHandle> {
        self.info.lock().expect("stream handle poisoned")
    }
}

/// Consumer end of a streaming response. Finite and not restartable;
/// the last event is always `Complete` or `Error`.
#[derive(Debug)]
pub struct AssistStream {
    stream_id: Uuid,
    events: mpsc::Receiver<AssistEvent>,
}

impl AssistStream {
    pub(crate) fn new(stream_id: Uuid, events: mpsc::Receiver<AssistEvent>) -> Self {
        Self { stream_id, events }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Next event, or `None` once the stream is drained or abandoned.
    pub async fn next_event(&mut self) -> Option<AssistEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<AssistEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Incremental parser for `data: <json>` framed event streams.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every complete event framed so far.
    /// A data line that is not a valid [`AssistEvent`] is a protocol
    /// error, never silently coerced.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<AssistEvent>, String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            for line in block.lines() {
                let line = line.trim_end_matches('\r');
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                let event: AssistEvent = serde_json::from_str(data)
                    .map_err(|e| format!("unparseable stream event: {e}"))?;
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Producer task: drains the response body into the channel, enforcing
/// cancellation and the idle timeout, and settles the registry entry.
///
/// The idle deadline is armed per parsed event, not per transport
/// chunk: keep-alive comment frames carry no event and must not keep a
/// stalled stream alive past the window.
pub(crate) async fn pump_stream<S, B, E>(
    entry: Arc<StreamEntry>,
    tx: mpsc::Sender<AssistEvent>,
    mut body: S,
    idle_timeout: Duration,
    open_by_session: Arc<DashMap<Uuid, Uuid>>,
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let (stream_id, session_id) = {
        let info = entry.snapshot();
        (info.id, info.session_id)
    };
    let mut parser = SseParser::new();
    let mut deadline = tokio::time::Instant::now() + idle_timeout;

    'outer: loop {
        let chunk = tokio::select! {
            // Dropping the response body below closes the connection, so
            // the worker sees the disconnect too.
            _ = entry.cancel.cancelled() => {
                entry.finish(StreamStatus::Cancelled);
                break;
            }
            next = tokio::time::timeout_at(deadline, body.next()) => match next {
                Err(_) => {
                    entry.finish(StreamStatus::Failed);
                    let _ = tx
                        .send(AssistEvent::Error {
                            message: format!("no stream event within {idle_timeout:?}"),
                        })
                        .await;
                    break;
                }
                Ok(None) => {
                    entry.finish(StreamStatus::Failed);
                    let _ = tx
                        .send(AssistEvent::Error {
                            message: "stream ended without a completion marker".into(),
                        })
                        .await;
                    break;
                }
                Ok(Some(Err(e))) => {
                    entry.finish(StreamStatus::Failed);
                    let _ = tx
                        .send(AssistEvent::Error {
                            message: format!("stream transport failed: {e}"),
                        })
                        .await;
                    break;
                }
                Ok(Some(Ok(bytes))) => bytes,
            }
        };

        let events = match parser.push(chunk.as_ref()) {
            Ok(events) => events,
            Err(reason) => {
                entry.finish(StreamStatus::Failed);
                let _ = tx.send(AssistEvent::Error { message: reason }).await;
                break;
            }
        };
        if !events.is_empty() {
            deadline = tokio::time::Instant::now() + idle_timeout;
        }

        for event in events {
            // No tokens are delivered once cancellation is acknowledged.
            if entry.cancel.is_cancelled() {
                entry.finish(StreamStatus::Cancelled);
                break 'outer;
            }
            let terminal = event.is_terminal();
            match &event {
                AssistEvent::Token { .. } => entry.bump_tokens(),
                AssistEvent::Complete { .. } => entry.finish(StreamStatus::Completed),
                AssistEvent::Error { .. } => entry.finish(StreamStatus::Failed),
            }
            if tx.send(event).await.is_err() {
                // Consumer abandoned the sequence.
                entry.finish(StreamStatus::Cancelled);
                break 'outer;
            }
            if terminal {
                break 'outer;
            }
        }
    }

    entry.close_notify();
    open_by_session.remove_if(&session_id, |_, open_id| *open_id == stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_frames() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"type\":\"token\",").unwrap();
        assert!(events.is_empty());

        let events = parser.push(b"\"token\":\"hi\"}\n\n").unwrap();
        assert_eq!(
            events,
            vec![AssistEvent::Token {
                token: "hi".into()
            }]
        );
    }

    #[test]
    fn parser_handles_multiple_frames_per_chunk() {
        let mut parser = SseParser::new();
        let chunk = concat!(
            "data: {\"type\":\"token\",\"token\":\"a\"}\n\n",
            "data: {\"type\":\"token\",\"token\":\"b\"}\n\n",
        );
        let events = parser.push(chunk.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn parser_rejects_malformed_events() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"type\":\"nope\"}\n\n").is_err());
    }

    #[test]
    fn parser_ignores_comments_and_done_markers() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\n\ndata: [DONE]\n\n").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn entry_finishes_exactly_once() {
        let (tx, _rx) = mpsc::channel(1);
        let entry = StreamEntry::new(Uuid::new_v4(), Uuid::new_v4(), tx);
        entry.finish(StreamStatus::Completed);
        entry.finish(StreamStatus::Failed);
        assert_eq!(entry.snapshot().status, StreamStatus::Completed);
    }

    type Chunk = Result<Vec<u8>, String>;

    #[tokio::test(start_paused = true)]
    async fn keep_alive_frames_do_not_extend_the_idle_window() {
        let (tx, mut rx) = mpsc::channel(8);
        let entry = StreamEntry::new(Uuid::new_v4(), Uuid::new_v4(), tx.clone());
        let (body_tx, body_rx) = mpsc::channel::<Chunk>(8);
        let body = tokio_stream::wrappers::ReceiverStream::new(body_rx);
        let open = Arc::new(DashMap::new());

        let pump = tokio::spawn(pump_stream(
            Arc::clone(&entry),
            tx,
            body,
            Duration::from_secs(30),
            Arc::clone(&open),
        ));

        // Comment frames arrive well inside the window, but no event
        // ever does.
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                if body_tx
                    .send(Ok(b": keep-alive\n\n".to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        match rx.recv().await {
            Some(AssistEvent::Error { message }) => {
                assert!(message.contains("no stream event"));
            }
            other => panic!("expected idle-timeout error, got {other:?}"),
        }
        pump.await.unwrap();
        assert_eq!(entry.snapshot().status, StreamStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn events_keep_the_stream_alive_past_the_idle_window() {
        let (tx, mut rx) = mpsc::channel(16);
        let entry = StreamEntry::new(Uuid::new_v4(), Uuid::new_v4(), tx.clone());
        let (body_tx, body_rx) = mpsc::channel::<Chunk>(16);
        let body = tokio_stream::wrappers::ReceiverStream::new(body_rx);
        let open = Arc::new(DashMap::new());

        let pump = tokio::spawn(pump_stream(
            Arc::clone(&entry),
            tx,
            body,
            Duration::from_secs(30),
            Arc::clone(&open),
        ));

        // Five tokens 20 s apart: total well past one idle window, but
        // each event re-arms the deadline.
        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_secs(20)).await;
                let frame = b"data: {\"type\":\"token\",\"token\":\"x\"}\n\n".to_vec();
                if body_tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            let complete = concat!(
                "data: {\"type\":\"complete\",\"full_content\":\"xxxxx\",",
                "\"metadata\":{\"tokens_emitted\":5,\"duration_ms\":100,\"model\":\"stub\"}}\n\n",
            );
            let _ = body_tx.send(Ok(complete.as_bytes().to_vec())).await;
        });

        let mut tokens = 0;
        loop {
            match rx.recv().await {
                Some(AssistEvent::Token { .. }) => tokens += 1,
                Some(AssistEvent::Complete { .. }) => break,
                other => panic!("expected token or complete, got {other:?}"),
            }
        }
        assert_eq!(tokens, 5);
        pump.await.unwrap();
        assert_eq!(entry.snapshot().status, StreamStatus::Completed);
    }
}
