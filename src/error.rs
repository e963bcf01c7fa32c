// SPDX-License-Identifier: MIT
//! The proxy's single error type. Every foreground failure path produces a
//! [`ProxyError`], which knows how to render itself both as an HTTP response
//! (`IntoResponse`) and as a JSON-RPC error code for the WebSocket proxy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("rate limited")]
    RateLimited,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Conflict(_) => StatusCode::CONFLICT,
            ProxyError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ProxyError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::ParseError(_) | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON-RPC 2.0 error code for the WebSocket proxy path (§6).
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ProxyError::ParseError(_) => -32700,
            ProxyError::InvalidRequest(_) => -32600,
            ProxyError::NotFound(_) => -32601,
            ProxyError::BadRequest(_) => -32602,
            ProxyError::UpstreamUnavailable(_) | ProxyError::Timeout(_) => -32001,
            _ => -32603,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::debug!(error = %self, %status, "request failed");
        let body = json!({
            "success": false,
            "error": { "code": status.as_u16(), "message": self.to_string() },
            "timestamp": crate::model::now_ms(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_409() {
        let e = ProxyError::Conflict("Another CLI client is driving this connection".into());
        assert_eq!(e.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn parse_error_maps_to_jsonrpc_32700() {
        assert_eq!(ProxyError::ParseError("bad json".into()).json_rpc_code(), -32700);
    }

    #[test]
    fn upstream_unavailable_maps_to_jsonrpc_32001() {
        assert_eq!(
            ProxyError::UpstreamUnavailable("closed".into()).json_rpc_code(),
            -32001
        );
    }
}
