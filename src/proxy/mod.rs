//! The streaming HTTP proxy (§4.5) and its two external interfaces (§6): the
//! catch-all forwarding handler and the `/ws/realtime` live-event subscriber.
//!
//! Grounded on the host crate's `proxy::mod`/`proxy::stream` (`handle_proxy`,
//! the header-filtering helpers, the `StreamFinalize` drop-guard idiom for
//! once-only request finalization), re-pointed at this crate's
//! catalog/router/lb/filter/usage/traffic_log/live_hub modules in place of the
//! host's multi-upstream-per-config retry model. This spec's catalog is
//! single-channel-per-name, so channel selection happens once per request with
//! no mid-request retry (§5: "a weight-based selector must not failover
//! mid-request").

mod stream;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use uuid::Uuid;

use crate::config::ServiceKind;
use crate::errors::ProxyError;
use crate::live_hub;
use crate::state::ProxyState;
use crate::traffic_log::TrafficLogEntry;
use crate::usage::{ProviderSchema, UsageMetrics};

use stream::RequestContext;

/// Upper bound on a buffered client request body. Chat/completions payloads are
/// small text documents; this only guards against a misbehaving client.
const MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Request headers reset before re-application (§4.5/§6).
const RESET_REQUEST_HEADERS: [&str; 4] = ["authorization", "host", "content-length", "x-api-key"];

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/ws/realtime", get(ws_handler))
        .fallback(handle_proxy)
        .with_state(state)
}

async fn ws_handler(State(state): State<Arc<ProxyState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        live_hub::serve_subscriber(state.live_hub.clone(), socket).await;
    })
}

fn service_schema(service: ServiceKind) -> ProviderSchema {
    match service {
        ServiceKind::Claude => ProviderSchema::Claude,
        ServiceKind::Codex => ProviderSchema::Codex,
    }
}

fn headers_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

fn headers_to_hashmap(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect()
}

/// The upstream `netloc` (host[:port]) parsed out of an absolute URL; no
/// dependency beyond substring search since the catalog only ever stores
/// `http(s)` URLs.
fn host_of(url: &str) -> &str {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

async fn handle_proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();
    let path = uri.path().to_string();
    let path_for_url = path.trim_start_matches('/');
    let query = uri.query().filter(|q| !q.is_empty()).map(str::to_string);

    let original_body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b.to_vec(),
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid request body").into_response(),
    };

    let configs = state.catalog.configs();
    let active = state.catalog.active();
    let Some(pre_override_channel) = state.lb.select(&configs, active.as_deref()) else {
        tracing::warn!(service = %state.service, "no active channel configured");
        return ProxyError::NoActiveConfig.into_response();
    };

    let known_channels: HashSet<String> = configs.keys().cloned().collect();
    let route_result = state.router.route(
        &original_body,
        Some(pre_override_channel.as_str()),
        &known_channels,
    );
    let final_channel = route_result.channel_override.unwrap_or(pre_override_channel);
    let Some(channel) = configs.get(&final_channel).cloned() else {
        tracing::warn!(service = %state.service, channel = %final_channel, "router overrode to an unknown channel");
        return ProxyError::NoActiveConfig.into_response();
    };

    let filtered_body = state.filter.apply(&route_result.body);

    let base_url = channel.base_url.trim_end_matches('/');
    let mut target_url = format!("{base_url}/{path_for_url}");
    if let Some(q) = &query {
        target_url.push('?');
        target_url.push_str(q);
    }

    let mut upstream_headers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if RESET_REQUEST_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        upstream_headers.append(name.clone(), value.clone());
    }
    if let Ok(v) = HeaderValue::from_str(host_of(&target_url)) {
        upstream_headers.insert(header::HOST, v);
    }
    if !upstream_headers.contains_key(header::CONNECTION) {
        upstream_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    if let Some(key) = &channel.api_key {
        if let Ok(v) = HeaderValue::from_str(key) {
            upstream_headers.insert("x-api-key", v);
        }
    }
    if let Some(token) = &channel.auth_token {
        if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
            upstream_headers.insert(header::AUTHORIZATION, v);
        }
    }

    let target_headers_log =
        crate::traffic_log::sanitize_header_map(&headers_to_btree(&upstream_headers));
    let original_headers_log = crate::traffic_log::sanitize_header_map(&headers_to_btree(&headers));

    state
        .live_hub
        .request_started(
            request_id.clone(),
            Some(final_channel.clone()),
            method.to_string(),
            path.clone(),
            headers_to_hashmap(&headers),
            Some(target_url.clone()),
        )
        .await;

    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    // §4.5: cap concurrent upstream connections; acquire_owned so the permit
    // can be moved into the streaming response and released only once the
    // whole body has been forwarded, not just once headers arrive.
    let permit = state
        .connection_permits
        .clone()
        .acquire_owned()
        .await
        .expect("connection_permits semaphore is never closed");
    let send_result = state
        .http_client
        .request(reqwest_method, &target_url)
        .headers(upstream_headers)
        .body(filtered_body.clone())
        .send()
        .await;

    match send_result {
        Ok(resp) => {
            let ctx = RequestContext {
                request_id: request_id.clone(),
                channel: final_channel.clone(),
                method: method.to_string(),
                target_url,
                target_headers: target_headers_log,
                original_headers: original_headers_log,
                original_body,
                filtered_body,
                schema: service_schema(state.service),
                _connection_permit: permit,
            };
            stream::stream_response(state, ctx, resp).await
        }
        Err(err) => {
            let proxy_err = ProxyError::from_upstream(&err);
            tracing::warn!(service = %state.service, channel = %final_channel, error = %proxy_err, "upstream request failed");
            state.lb.record_result(&final_channel, false);
            let duration_ms = start.elapsed().as_millis() as u64;
            state
                .live_hub
                .request_completed(request_id.clone(), 500, duration_ms, false)
                .await;

            let error_body =
                serde_json::json!({ "error": proxy_err.kind(), "detail": proxy_err.to_string() })
                    .to_string();
            let entry = TrafficLogEntry {
                timestamp: live_hub::now_iso(),
                service: state.service.as_str().to_string(),
                method: method.to_string(),
                path: target_url,
                status_code: 500,
                duration_ms,
                channel: Some(final_channel),
                target_headers: target_headers_log,
                original_headers: original_headers_log,
                original_body_b64: base64_encode(&original_body),
                filtered_body_b64: base64_encode(&filtered_body),
                usage: UsageMetrics::default(),
                response_b64: base64_encode(error_body.as_bytes()),
                response_bytes: error_body.len() as u64,
                response_truncated: false,
                response_headers: None,
            };
            let cap = state.log_limit();
            let write_state = state.clone();
            tokio::task::spawn_blocking(move || write_state.traffic_log.append(entry, cap));

            proxy_err.into_response()
        }
    }
}
