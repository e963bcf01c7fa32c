// SPDX-License-Identifier: MIT
//! Cross-cutting HTTP concerns applied in front of every route (§4.7):
//! security headers, request logging, a method/content-type allowlist,
//! two-tier rate limiting, and JSON input sanitization.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Control characters stripped from user-supplied strings before they're
/// archived or forwarded upstream (§4.7): C0 controls except the ones JSON's
/// own escaping already handles safely, plus DEL.
fn is_stripped_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F | 0x7F)
}

const MAX_STRING_LEN: usize = 10_000;

/// Strip disallowed control characters and cap length. Applied to every
/// string value reachable from a request body before it is used.
pub fn sanitize_string(s: &str) -> String {
    let cleaned: String = s.chars().filter(|c| !is_stripped_control(*c)).collect();
    if cleaned.chars().count() > MAX_STRING_LEN {
        cleaned.chars().take(MAX_STRING_LEN).collect()
    } else {
        cleaned
    }
}

/// Recursively sanitize every string reachable from a JSON value in place.
pub fn sanitize_json(value: &mut Value) {
    match value {
        Value::String(s) => *s = sanitize_string(s),
        Value::Array(items) => items.iter_mut().for_each(sanitize_json),
        Value::Object(map) => map.values_mut().for_each(sanitize_json),
        _ => {}
    }
}

/// Per-IP sliding-window rate limiter with two tiers (§4.7): a generous
/// global limit, and a tighter one for routes that mutate state or talk to
/// an upstream.
pub struct RateLimiter {
    general_limit: u32,
    sensitive_limit: u32,
    general: Mutex<HashMap<IpAddr, Vec<Instant>>>,
    sensitive: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(general_limit: u32, sensitive_limit: u32) -> Self {
        Self {
            general_limit,
            sensitive_limit,
            general: Mutex::new(HashMap::new()),
            sensitive: Mutex::new(HashMap::new()),
        }
    }

    async fn check(bucket: &Mutex<HashMap<IpAddr, Vec<Instant>>>, ip: IpAddr, limit: u32) -> bool {
        let now = Instant::now();
        let window_start = now - Duration::from_secs(60);
        let mut buckets = bucket.lock().await;
        let timestamps = buckets.entry(ip).or_default();
        timestamps.retain(|t| *t > window_start);
        if timestamps.len() >= limit as usize {
            return false;
        }
        timestamps.push(now);
        true
    }

    pub async fn allow(&self, ip: IpAddr, sensitive: bool) -> bool {
        let general_ok = Self::check(&self.general, ip, self.general_limit).await;
        if !general_ok {
            return false;
        }
        if sensitive {
            return Self::check(&self.sensitive, ip, self.sensitive_limit).await;
        }
        true
    }
}

/// Routes exempt from rate limiting entirely: liveness checks should keep
/// working even when a client is being throttled elsewhere.
fn is_exempt(path: &str) -> bool {
    path == "/api/health" || path == "/api/status" || path == "/metrics"
}

/// Routes held to the tighter sensitive-tier limit: anything that mutates
/// connection state or drives a command upstream.
fn is_sensitive(path: &str) -> bool {
    path == "/api/connect" || path.starts_with("/api/execute/") || path.starts_with("/api/connection/")
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if is_exempt(&path) {
        return next.run(req).await;
    }
    if !limiter.allow(addr.ip(), is_sensitive(&path)).await {
        return ProxyError::RateLimited.into_response();
    }
    next.run(req).await
}

pub async fn enforce_allowlist(req: Request<Body>, next: Next) -> Response {
    match *req.method() {
        Method::GET | Method::POST | Method::PUT | Method::DELETE | Method::OPTIONS => {}
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
    if matches!(*req.method(), Method::POST) {
        let content_type = req
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.is_empty() && !content_type.starts_with("application/json") {
            return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
        }
    }
    next.run(req).await
}

fn exceeds_body_limit(content_length: Option<usize>, max: usize) -> bool {
    content_length.is_some_and(|len| len > max)
}

/// Reject oversized bodies by `Content-Length` before they reach a handler,
/// reporting the same `{success, error}` envelope as every other rejected
/// request rather than the bare status line `DefaultBodyLimit` would return.
pub async fn enforce_body_limit(
    State(config): State<Arc<ProxyConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let content_length = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok());
    if exceeds_body_limit(content_length, config.max_body_bytes) {
        return ProxyError::PayloadTooLarge.into_response();
    }
    next.run(req).await
}

pub async fn security_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.remove("server");
    response
}

pub async fn request_logging(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_chars_and_keeps_text() {
        let input = "hi\u{0000}there\u{007F}!";
        assert_eq!(sanitize_string(input), "hithere!");
    }

    #[test]
    fn sanitize_truncates_long_strings() {
        let long = "a".repeat(MAX_STRING_LEN + 50);
        assert_eq!(sanitize_string(&long).chars().count(), MAX_STRING_LEN);
    }

    #[test]
    fn sanitize_json_recurses_into_nested_values() {
        let mut v = serde_json::json!({"a": ["x\u{0000}y", {"b": "z\u{001F}"}]});
        sanitize_json(&mut v);
        assert_eq!(v["a"][0], "xy");
        assert_eq!(v["a"][1]["b"], "z");
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit_reached() {
        let limiter = RateLimiter::new(2, 1);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip, false).await);
        assert!(limiter.allow(ip, false).await);
        assert!(!limiter.allow(ip, false).await);
    }

    #[tokio::test]
    async fn sensitive_tier_is_stricter_than_general() {
        let limiter = RateLimiter::new(100, 1);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow(ip, true).await);
        assert!(!limiter.allow(ip, true).await);
        assert!(limiter.allow(ip, false).await);
    }

    #[test]
    fn exempt_routes_bypass_limiting() {
        assert!(is_exempt("/api/health"));
        assert!(is_exempt("/api/status"));
        assert!(is_exempt("/metrics"));
        assert!(!is_exempt("/api/connect"));
    }

    #[test]
    fn sensitive_routes_are_flagged() {
        assert!(is_sensitive("/api/connect"));
        assert!(is_sensitive("/api/execute/abc123"));
        assert!(is_sensitive("/api/connection/abc123"));
        assert!(!is_sensitive("/api/console/abc123"));
    }

    #[test]
    fn exceeds_body_limit_flags_only_oversized_lengths() {
        assert!(exceeds_body_limit(Some(11), 10));
        assert!(!exceeds_body_limit(Some(10), 10));
        assert!(!exceeds_body_limit(Some(5), 10));
        assert!(!exceeds_body_limit(None, 10));
    }
}
