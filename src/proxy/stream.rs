//! Streamed upstream response forwarding with once-only request finalization.
//!
//! Grounded on the host crate's `proxy::stream` (`StreamFinalize`'s drop-guard
//! idiom: a request is finalized exactly once whether the response stream runs
//! to completion or is dropped early by a disconnecting client). The host
//! performs finalization purely synchronously inside `Drop`; here finalization
//! also needs async calls (`live_hub`, `traffic_log`), so the common path runs
//! it inline as the last item of the forwarded stream (preserving the §5 event
//! ordering guarantee for free, since `Body::from_stream` polls items in
//! order) and `Drop` is only the safety net for the disconnect case, where the
//! tail item never gets polled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use futures_util::StreamExt;
use tokio::sync::OwnedSemaphorePermit;

use crate::live_hub;
use crate::state::ProxyState;
use crate::traffic_log::{self, TrafficLogEntry};
use crate::usage::ProviderSchema;

pub(super) struct RequestContext {
    pub request_id: String,
    pub channel: String,
    pub method: String,
    pub target_url: String,
    pub target_headers: BTreeMap<String, String>,
    pub original_headers: BTreeMap<String, String>,
    pub original_body: Vec<u8>,
    pub filtered_body: Vec<u8>,
    pub schema: ProviderSchema,
    /// Held until the response stream (or `Drop`'s disconnect path) finishes,
    /// so the §4.5 concurrent-connection cap covers the whole forwarding
    /// lifetime, not just the initial upstream `send()`.
    pub _connection_permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct CaptureState {
    buffer: Vec<u8>,
    total_bytes: u64,
    truncated: bool,
    first_byte_seen: bool,
    stream_error: bool,
    finished: bool,
}

/// Per-request context carried through the response stream, owning the single
/// point of finalization (traffic-log write, live-hub `completed`/`failed`
/// event, LB failure recording).
struct StreamFinalize {
    state: Arc<ProxyState>,
    request_id: String,
    channel: String,
    method: String,
    log_path: String,
    start: Instant,
    status_code: u16,
    target_headers: BTreeMap<String, String>,
    original_headers: BTreeMap<String, String>,
    original_body: Vec<u8>,
    filtered_body: Vec<u8>,
    response_headers_for_log: BTreeMap<String, String>,
    schema: ProviderSchema,
    capture: Mutex<CaptureState>,
    _connection_permit: OwnedSemaphorePermit,
}

/// Owned snapshot handed to the shared finalize routine; built either from a
/// live `&StreamFinalize` (normal end-of-stream) or extracted out of one via
/// `Drop` (client disconnect).
struct FinalizeData {
    state: Arc<ProxyState>,
    request_id: String,
    channel: String,
    method: String,
    log_path: String,
    target_headers: BTreeMap<String, String>,
    original_headers: BTreeMap<String, String>,
    original_body: Vec<u8>,
    filtered_body: Vec<u8>,
    response_headers_for_log: BTreeMap<String, String>,
    schema: ProviderSchema,
    status_code: u16,
    duration_ms: u64,
    buffer: Vec<u8>,
    total_bytes: u64,
    truncated: bool,
    success: bool,
}

async fn write_finalize(data: FinalizeData) {
    data.state.lb.record_result(&data.channel, data.success);
    data.state
        .live_hub
        .request_completed(data.request_id.clone(), data.status_code, data.duration_ms, data.success)
        .await;

    let usage = crate::usage::extract_usage_from_bytes(data.schema, &data.buffer);
    let (response_b64, _, _) = traffic_log::cap_and_encode(&data.buffer);
    let entry = TrafficLogEntry {
        timestamp: live_hub::now_iso(),
        service: data.state.service.as_str().to_string(),
        method: data.method,
        path: data.log_path,
        status_code: data.status_code,
        duration_ms: data.duration_ms,
        channel: Some(data.channel),
        target_headers: data.target_headers,
        original_headers: data.original_headers,
        original_body_b64: base64::engine::general_purpose::STANDARD.encode(&data.original_body),
        filtered_body_b64: base64::engine::general_purpose::STANDARD.encode(&data.filtered_body),
        usage,
        response_b64,
        response_bytes: data.total_bytes,
        response_truncated: data.truncated,
        response_headers: Some(data.response_headers_for_log),
    };
    let cap = data.state.log_limit();
    let log_state = data.state.clone();
    tokio::task::spawn_blocking(move || log_state.traffic_log.append(entry, cap));
}

impl StreamFinalize {
    async fn on_chunk(&self, chunk: &Bytes) {
        let is_first = {
            let mut cap = self.capture.lock().unwrap();
            let first = !cap.first_byte_seen;
            cap.first_byte_seen = true;
            cap.total_bytes += chunk.len() as u64;
            if !cap.truncated {
                let remaining = traffic_log::RESPONSE_CAPTURE_CAP.saturating_sub(cap.buffer.len());
                let take = remaining.min(chunk.len());
                cap.buffer.extend_from_slice(&chunk[..take]);
                if take < chunk.len() {
                    cap.truncated = true;
                }
            }
            first
        };
        let duration_ms = self.start.elapsed().as_millis() as u64;
        if is_first {
            self.state
                .live_hub
                .request_streaming(&self.request_id, duration_ms)
                .await;
        }
        let text = String::from_utf8_lossy(chunk);
        if !text.trim().is_empty() {
            self.state
                .live_hub
                .response_chunk(&self.request_id, &text, duration_ms)
                .await;
        }
    }

    async fn on_stream_error(&self) {
        self.capture.lock().unwrap().stream_error = true;
    }

    /// The success path: the response stream ran to completion (with or
    /// without a transport error along the way). No-op if `Drop` already
    /// finalized this request (it cannot have, since this runs before the
    /// stream is dropped, but the `finished` guard keeps the invariant
    /// explicit rather than assumed).
    async fn on_stream_end(&self) {
        let (buffer, total_bytes, truncated, stream_error) = {
            let mut cap = self.capture.lock().unwrap();
            if cap.finished {
                return;
            }
            cap.finished = true;
            (
                std::mem::take(&mut cap.buffer),
                cap.total_bytes,
                cap.truncated,
                cap.stream_error,
            )
        };

        let duration_ms = self.start.elapsed().as_millis() as u64;
        let success = !stream_error && (200..300).contains(&self.status_code);
        let data = FinalizeData {
            state: self.state.clone(),
            request_id: self.request_id.clone(),
            channel: self.channel.clone(),
            method: self.method.clone(),
            log_path: self.log_path.clone(),
            target_headers: self.target_headers.clone(),
            original_headers: self.original_headers.clone(),
            original_body: self.original_body.clone(),
            filtered_body: self.filtered_body.clone(),
            response_headers_for_log: self.response_headers_for_log.clone(),
            schema: self.schema,
            status_code: self.status_code,
            duration_ms,
            buffer,
            total_bytes,
            truncated,
            success,
        };
        write_finalize(data).await;
    }
}

impl Drop for StreamFinalize {
    /// Safety net for a client that disconnects before the stream's tail item
    /// (the one that calls `on_stream_end`) is ever polled: `Body::from_stream`
    /// drops the stream, which drops this, and finalization still has to run
    /// so the load balancer, live hub, and traffic log all see a closed
    /// request rather than one stuck open forever (§5 cancellation).
    fn drop(&mut self) {
        let (buffer, total_bytes, truncated) = {
            let mut cap = self.capture.lock().unwrap();
            if cap.finished {
                return;
            }
            cap.finished = true;
            (
                std::mem::take(&mut cap.buffer),
                cap.total_bytes,
                cap.truncated,
            )
        };

        let duration_ms = self.start.elapsed().as_millis() as u64;
        let data = FinalizeData {
            state: self.state.clone(),
            request_id: std::mem::take(&mut self.request_id),
            channel: std::mem::take(&mut self.channel),
            method: std::mem::take(&mut self.method),
            log_path: std::mem::take(&mut self.log_path),
            target_headers: std::mem::take(&mut self.target_headers),
            original_headers: std::mem::take(&mut self.original_headers),
            original_body: std::mem::take(&mut self.original_body),
            filtered_body: std::mem::take(&mut self.filtered_body),
            response_headers_for_log: std::mem::take(&mut self.response_headers_for_log),
            schema: self.schema,
            status_code: 499,
            duration_ms,
            buffer,
            total_bytes,
            truncated,
            success: false,
        };
        tokio::spawn(write_finalize(data));
    }
}

/// Build the client-facing response for a successful upstream connection,
/// tee-ing the body into the captured buffer as it streams and finalizing the
/// request once the stream (or the client) is done with it.
pub(super) async fn stream_response(
    state: Arc<ProxyState>,
    ctx: RequestContext,
    resp: reqwest::Response,
) -> Response {
    let status = resp.status();
    let resp_headers = resp.headers().clone();

    let mut response_headers_for_log = BTreeMap::new();
    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in resp_headers.iter() {
        let lname = name.as_str().to_ascii_lowercase();
        let value_str = value.to_str().unwrap_or("").to_string();
        if lname == "connection" || lname == "transfer-encoding" {
            response_headers_for_log.insert(format!("{} [stripped]", name.as_str()), value_str);
            continue;
        }
        response_headers_for_log.insert(name.as_str().to_string(), value_str);
        builder = builder.header(name, value);
    }

    let finalize = Arc::new(StreamFinalize {
        state,
        request_id: ctx.request_id,
        channel: ctx.channel,
        method: ctx.method,
        log_path: ctx.target_url,
        start: Instant::now(),
        status_code: status.as_u16(),
        target_headers: ctx.target_headers,
        original_headers: ctx.original_headers,
        original_body: ctx.original_body,
        filtered_body: ctx.filtered_body,
        response_headers_for_log,
        schema: ctx.schema,
        capture: Mutex::new(CaptureState::default()),
        _connection_permit: ctx._connection_permit,
    });

    let tee = finalize.clone();
    let mapped = resp.bytes_stream().then(move |item| {
        let tee = tee.clone();
        async move {
            match item {
                Ok(chunk) => {
                    tee.on_chunk(&chunk).await;
                    Ok(chunk)
                }
                Err(e) => {
                    tee.on_stream_error().await;
                    Err(e)
                }
            }
        }
    });
    let ender = finalize.clone();
    let ended = futures_util::stream::once(async move {
        ender.on_stream_end().await;
        Ok::<Bytes, reqwest::Error>(Bytes::new())
    });
    let body_stream = mapped.chain(ended);

    match builder.body(Body::from_stream(body_stream)) {
        Ok(response) => response,
        Err(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
        }
    }
}
