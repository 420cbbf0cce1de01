use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error surfaced to an HTTP caller. Carries the machine-readable `kind` used both in the
/// JSON body and for load-balancer failure bookkeeping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("no active config")]
    NoActiveConfig,
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    #[error("connect error: {0}")]
    ConnectError(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
}

impl ProxyError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::NoActiveConfig => "no active config",
            ProxyError::ConnectTimeout(_) => "connect timeout",
            ProxyError::ReadTimeout(_) => "read timeout",
            ProxyError::ConnectError(_) => "connect error",
            ProxyError::RequestFailed(_) => "request failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    /// From a reqwest error encountered while talking to the upstream.
    pub fn from_upstream(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            if err.is_connect() {
                ProxyError::ConnectTimeout(err.to_string())
            } else {
                ProxyError::ReadTimeout(err.to_string())
            }
        } else if err.is_connect() {
            ProxyError::ConnectError(err.to_string())
        } else {
            ProxyError::RequestFailed(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.kind(), "detail": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
