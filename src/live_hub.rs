//! The live-event hub (§4.7): a per-service broadcast of request lifecycle events to
//! connected subscribers (e.g. a WebSocket-backed dashboard), plus a snapshot of
//! currently in-flight requests sent on connect.
//!
//! Built fresh — the host crate has no equivalent despite enabling axum's `ws`
//! feature — grounded on `original_source/src/core/realtime_hub.py`'s
//! `RealTimeRequestHub` (field names, 2 MiB response-chunk cap with one truncation
//! marker, empty-delta skipping, 30s delayed cleanup, oldest-by-start-time
//! eviction past 100 concurrent records, and header sanitization) translated into
//! the Arc<RwLock<HashMap<..>>> + tokio::spawn idiom the host crate uses elsewhere
//! (e.g. `state.rs`'s subscriber-less shared maps) instead of asyncio primitives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};

const MAX_ACTIVE_REQUESTS: usize = 100;
const MAX_RESPONSE_CHUNK_BYTES: usize = 2 * 1024 * 1024;
const CLEANUP_DELAY: Duration = Duration::from_secs(30);
const TRUNCATION_MARKER: &str = "...[response truncated]...";
const SANITIZED_HEADER_NAMES: [&str; 3] = ["authorization", "x-api-key", "cookie"];
const HIDDEN_MARKER: &str = "[hidden]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveRequest {
    pub request_id: String,
    pub service: String,
    pub channel: Option<String>,
    pub method: String,
    pub path: String,
    pub start_time: String,
    pub status: RequestStatus,
    pub duration_ms: u64,
    pub status_code: Option<u16>,
    pub request_headers: HashMap<String, String>,
    pub response_chunks_len: usize,
    pub response_truncated: bool,
    pub target_url: Option<String>,
}

/// Redacts sensitive headers before they are attached to a live record or logged
/// (§3 "sanitized" qualifier on the live Request record).
pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if SANITIZED_HEADER_NAMES.contains(&k.to_ascii_lowercase().as_str()) {
                (k.clone(), HIDDEN_MARKER.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

struct ActiveRequest {
    record: LiveRequest,
    response_chunks: String,
}

struct HubInner {
    active: HashMap<String, ActiveRequest>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Message>>,
    next_subscriber_id: u64,
}

/// Per-service live-event hub. Cheap to clone (wraps an `Arc`); continues tracking
/// state and broadcasting events even with zero subscribers connected.
#[derive(Clone)]
pub struct LiveHub {
    service: String,
    inner: Arc<RwLock<HubInner>>,
}

/// Real ISO-8601/RFC3339 timestamp, seconds precision (§3/§6: traffic-log and
/// live-event timestamps are specified as "ISO-8601 seconds").
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

impl LiveHub {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            inner: Arc::new(RwLock::new(HubInner {
                active: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.active.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.read().await.subscribers.len()
    }

    /// Registers a new subscriber connection and returns a receiver of outbound
    /// frames plus an immediate snapshot of all active requests.
    pub async fn connect(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;

        // §4.7: "send a snapshot of every non-terminal record" — a COMPLETED/FAILED
        // record lingering in `active` during its 30s retention window is not
        // snapshotted; a new subscriber only needs to know about in-flight requests.
        for active in inner.active.values().filter(|a| {
            !matches!(a.record.status, RequestStatus::Completed | RequestStatus::Failed)
        }) {
            let msg = json!({ "type": "snapshot" });
            let mut obj = serde_json::to_value(&active.record).unwrap_or(json!({}));
            if let Value::Object(ref mut map) = obj {
                map.extend(msg.as_object().unwrap().clone());
            }
            let _ = tx.send(Message::Text(obj.to_string().into()));
        }
        inner.subscribers.insert(id, tx);
        (id, rx)
    }

    pub async fn disconnect(&self, id: u64) {
        self.inner.write().await.subscribers.remove(&id);
    }

    async fn broadcast(&self, event_type: &str, request_id: &str, extra: Value) {
        let mut payload = json!({
            "type": event_type,
            "request_id": request_id,
            "service": self.service,
            "timestamp": now_iso(),
        });
        if let (Value::Object(ref mut map), Value::Object(extra_map)) = (&mut payload, extra) {
            map.extend(extra_map);
        }
        let text = payload.to_string();

        let mut inner = self.inner.write().await;
        let mut dead = Vec::new();
        for (id, tx) in inner.subscribers.iter() {
            if tx.send(Message::Text(text.clone().into())).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
    }

    /// Called when a request is first accepted, after routing/channel selection.
    pub async fn request_started(
        &self,
        request_id: String,
        channel: Option<String>,
        method: String,
        path: String,
        request_headers: HashMap<String, String>,
        target_url: Option<String>,
    ) {
        let record = LiveRequest {
            request_id: request_id.clone(),
            service: self.service.clone(),
            channel: channel.clone(),
            method: method.clone(),
            path: path.clone(),
            start_time: now_iso(),
            status: RequestStatus::Pending,
            duration_ms: 0,
            status_code: None,
            request_headers: sanitize_headers(&request_headers),
            response_chunks_len: 0,
            response_truncated: false,
            target_url: target_url.clone(),
        };

        {
            let mut inner = self.inner.write().await;
            self.evict_oldest_if_over_cap(&mut inner);
            inner.active.insert(
                request_id.clone(),
                ActiveRequest {
                    record: record.clone(),
                    response_chunks: String::new(),
                },
            );
        }

        self.broadcast(
            "started",
            &request_id,
            json!({
                "channel": channel,
                "method": method,
                "path": path,
                "status": "PENDING",
                "request_headers": sanitize_headers(&record.request_headers),
                "target_url": target_url,
            }),
        )
        .await;
    }

    fn evict_oldest_if_over_cap(&self, inner: &mut HubInner) {
        if inner.active.len() < MAX_ACTIVE_REQUESTS {
            return;
        }
        if let Some(oldest_id) = inner
            .active
            .iter()
            .min_by(|a, b| a.1.record.start_time.cmp(&b.1.record.start_time))
            .map(|(id, _)| id.clone())
        {
            inner.active.remove(&oldest_id);
        }
    }

    /// Called on the first response byte: transitions PENDING -> STREAMING.
    pub async fn request_streaming(&self, request_id: &str, duration_ms: u64) {
        {
            let mut inner = self.inner.write().await;
            if let Some(active) = inner.active.get_mut(request_id) {
                active.record.status = RequestStatus::Streaming;
                active.record.duration_ms = duration_ms;
            }
        }
        self.broadcast(
            "progress",
            request_id,
            json!({ "status": "STREAMING", "duration_ms": duration_ms }),
        )
        .await;
    }

    /// Called for each response chunk as bytes arrive. Empty/whitespace-only
    /// deltas are tracked for the 2 MiB cap but do not trigger a broadcast.
    pub async fn response_chunk(&self, request_id: &str, chunk: &str, duration_ms: u64) {
        let mut truncated_now = false;
        {
            let mut inner = self.inner.write().await;
            if let Some(active) = inner.active.get_mut(request_id) {
                active.record.duration_ms = duration_ms;
                if !active.record.response_truncated {
                    if active.response_chunks.len() + chunk.len() > MAX_RESPONSE_CHUNK_BYTES {
                        let remaining =
                            MAX_RESPONSE_CHUNK_BYTES.saturating_sub(active.response_chunks.len());
                        active.response_chunks.push_str(&chunk[..remaining.min(chunk.len())]);
                        active.response_chunks.push_str(TRUNCATION_MARKER);
                        active.record.response_truncated = true;
                        truncated_now = true;
                    } else {
                        active.response_chunks.push_str(chunk);
                    }
                    active.record.response_chunks_len = active.response_chunks.len();
                }
            }
        }
        let _ = truncated_now;
        if chunk.trim().is_empty() {
            return;
        }
        self.broadcast(
            "progress",
            request_id,
            json!({ "response_delta": chunk, "duration_ms": duration_ms }),
        )
        .await;
    }

    /// Called once, at stream end: COMPLETED on success, FAILED otherwise. Schedules
    /// eviction from the active set 30s later (§3/§4.7 retention rule).
    pub async fn request_completed(
        &self,
        request_id: String,
        status_code: u16,
        duration_ms: u64,
        success: bool,
    ) {
        {
            let mut inner = self.inner.write().await;
            if let Some(active) = inner.active.get_mut(&request_id) {
                active.record.status = if success {
                    RequestStatus::Completed
                } else {
                    RequestStatus::Failed
                };
                active.record.status_code = Some(status_code);
                active.record.duration_ms = duration_ms;
            }
        }

        self.broadcast(
            if success { "completed" } else { "failed" },
            &request_id,
            json!({ "status_code": status_code, "duration_ms": duration_ms }),
        )
        .await;

        let hub = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_DELAY).await;
            hub.inner.write().await.active.remove(&request_id);
        });
    }
}

/// Drives one WebSocket connection: forwards hub broadcasts to the socket, pings
/// idle connections every 30s, and deregisters the subscriber on disconnect.
pub async fn serve_subscriber(hub: LiveHub, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split_sink_stream();
    let (id, mut rx) = hub.connect().await;

    let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
    ping_interval.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next_message() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
    hub.disconnect(id).await;
}

/// Minimal split helper kept local to this module: axum's `WebSocket` already
/// implements `Stream`/`Sink`, this just gives the two halves friendlier names
/// and a `next_message` convenience used by `serve_subscriber` above.
trait WebSocketSplitExt {
    fn split_sink_stream(self) -> (WsSender, WsReceiver);
}

impl WebSocketSplitExt for WebSocket {
    fn split_sink_stream(self) -> (WsSender, WsReceiver) {
        use futures_util::StreamExt;
        let (tx, rx) = self.split();
        (WsSender(tx), WsReceiver(rx))
    }
}

struct WsSender(futures_util::stream::SplitSink<WebSocket, Message>);
struct WsReceiver(futures_util::stream::SplitStream<WebSocket>);

impl WsSender {
    async fn send(&mut self, msg: Message) -> Result<(), axum::Error> {
        use futures_util::SinkExt;
        self.0.send(msg).await
    }
}

impl WsReceiver {
    async fn next_message(&mut self) -> Option<Message> {
        use futures_util::StreamExt;
        match self.0.next().await {
            Some(Ok(msg)) => Some(msg),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn started_then_completed_broadcast_without_subscribers() {
        let hub = LiveHub::new("claude");
        hub.request_started(
            "r1".into(),
            Some("p1".into()),
            "POST".into(),
            "/messages".into(),
            HashMap::new(),
            Some("https://upstream/messages".into()),
        )
        .await;
        assert_eq!(hub.active_count().await, 1);

        hub.request_completed("r1".into(), 200, 42, true).await;
        assert_eq!(hub.active_count().await, 1); // still retained for the 30s window
    }

    #[tokio::test]
    async fn response_chunk_respects_cap_and_marks_truncated() {
        let hub = LiveHub::new("claude");
        hub.request_started(
            "r1".into(),
            None,
            "POST".into(),
            "/messages".into(),
            HashMap::new(),
            None,
        )
        .await;
        let big = "a".repeat(MAX_RESPONSE_CHUNK_BYTES + 10);
        hub.response_chunk("r1", &big, 1).await;
        let inner = hub.inner.read().await;
        let active = inner.active.get("r1").unwrap();
        assert!(active.record.response_truncated);
        assert!(active.response_chunks.len() <= MAX_RESPONSE_CHUNK_BYTES + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn empty_delta_updates_duration_but_does_not_broadcast() {
        let hub = LiveHub::new("claude");
        hub.request_started(
            "r1".into(),
            None,
            "POST".into(),
            "/messages".into(),
            HashMap::new(),
            None,
        )
        .await;
        let (_id, mut rx) = hub.connect().await;
        hub.response_chunk("r1", "   ", 5).await;
        // No progress frame should arrive for a whitespace-only delta.
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err() || result.unwrap().is_none());
    }

    #[test]
    fn sanitize_headers_hides_sensitive_names() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer secret".to_string());
        headers.insert("X-Api-Key".to_string(), "k".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized["Authorization"], HIDDEN_MARKER);
        assert_eq!(sanitized["X-Api-Key"], HIDDEN_MARKER);
        assert_eq!(sanitized["Content-Type"], "application/json");
    }
}
