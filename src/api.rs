// SPDX-License-Identifier: MIT
//! The HTTP surface (§6): connection lifecycle, command execution, history
//! queries, health/status, and the `/metrics` exposition, all wrapped in the
//! same `{success, data, error, timestamp}` envelope.

use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ProxyError, ProxyResult};
use crate::message_store::{ConsoleFilter, NetworkFilter};
use crate::model::{is_valid_connection_id, now_ms, ApiEnvelope, ConsoleLevel, ConsoleSource};
use crate::server::AppState;

fn envelope<T: serde::Serialize>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope::ok(data))
}

fn require_valid_id(id: &str) -> ProxyResult<()> {
    if is_valid_connection_id(id) {
        Ok(())
    } else {
        Err(ProxyError::BadRequest(format!("malformed connection id {id}")))
    }
}

fn compile_pattern(raw: &str) -> ProxyResult<regex::Regex> {
    RegexBuilder::new(raw)
        .case_insensitive(true)
        .build()
        .map_err(|e| ProxyError::BadRequest(format!("invalid pattern: {e}")))
}

// ─── POST /api/connect ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub target_id: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> ProxyResult<impl IntoResponse> {
    state.touch();
    if req.host.trim().is_empty() || req.port == 0 {
        return Err(ProxyError::BadRequest("host and port are required".into()));
    }
    if !state.config.host_allowed(&req.host) {
        return Err(ProxyError::PolicyDenied(format!("host {} is not allowed", req.host)));
    }

    let (connection_id, target, is_new) = state
        .pool
        .get_or_create(&req.host, req.port, req.target_id.as_deref())
        .await?;

    Ok(envelope(json!({
        "connectionId": connection_id,
        "targetInfo": {
            "id": target.id,
            "title": target.title,
            "url": target.url,
            "type": target.target_type,
        },
        "isNewConnection": is_new,
    })))
}

// ─── DELETE /api/connection/:id ─────────────────────────────────────────────

pub async fn disconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ProxyResult<impl IntoResponse> {
    state.touch();
    require_valid_id(&id)?;
    state.pool.close(&id).await?;
    state.executor.release(&id).await;
    Ok(envelope(json!({ "connectionId": id, "closed": true })))
}

// ─── GET /api/connections ───────────────────────────────────────────────────

pub async fn connections(State(state): State<AppState>) -> impl IntoResponse {
    state.touch();
    let summaries = state.pool.list().await;
    let (console_total, network_total) = state.store.totals().await;
    envelope(json!({
        "connections": summaries,
        "storage": { "consoleEntries": console_total, "networkEntries": network_total },
    }))
}

// ─── POST /api/execute/:id ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExecuteCommand {
    #[serde(default)]
    pub id: Option<i64>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub command: ExecuteCommand,
    #[serde(default)]
    pub timeout: Option<u64>,
}

pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    mut body: Json<ExecuteRequest>,
) -> ProxyResult<impl IntoResponse> {
    state.touch();
    require_valid_id(&id)?;
    crate::middleware::sanitize_json(&mut body.command.params);

    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::BadRequest("missing x-client-id header".into()))?
        .to_string();

    let timeout = body
        .timeout
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.command_timeout());

    let (result, execution_time) = state
        .executor
        .execute(&id, &body.command.method, body.command.params.clone(), timeout, &client_id)
        .await?;

    Ok(envelope(json!({ "result": result, "executionTime": execution_time })))
}

// ─── GET /api/console/:id ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleQuery {
    pub types: Option<String>,
    pub text_pattern: Option<String>,
    pub source: Option<String>,
    pub max_messages: Option<usize>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

pub async fn console(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ConsoleQuery>,
) -> ProxyResult<impl IntoResponse> {
    state.touch();
    require_valid_id(&id)?;
    state.pool.summary(&id).await?;

    let types = q.types.map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ConsoleLevel::normalize)
            .collect::<HashSet<_>>()
    });
    let source = match q.source.as_deref() {
        Some("console-api") => Some(ConsoleSource::ConsoleApi),
        Some("log-entry") => Some(ConsoleSource::LogEntry),
        Some(other) => return Err(ProxyError::BadRequest(format!("unknown source filter {other}"))),
        None => None,
    };
    let text_pattern = q.text_pattern.as_deref().map(compile_pattern).transpose()?;

    let filter = ConsoleFilter {
        types,
        text_pattern,
        source,
        start_time: q.start_time,
        end_time: q.end_time,
        max: q.max_messages,
    };
    let messages = state.store.query_console(&id, &filter).await;
    let total_count = messages.len();
    Ok(envelope(json!({ "messages": messages, "totalCount": total_count })))
}

// ─── GET /api/network/:id ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkQuery {
    pub methods: Option<String>,
    pub status_codes: Option<String>,
    pub url_pattern: Option<String>,
    pub max_requests: Option<usize>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    #[serde(default)]
    pub include_response_body: bool,
}

pub async fn network(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<NetworkQuery>,
) -> ProxyResult<impl IntoResponse> {
    state.touch();
    require_valid_id(&id)?;
    state.pool.summary(&id).await?;

    let methods = q.methods.map(|csv| {
        csv.split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect::<HashSet<_>>()
    });
    let status_codes = q
        .status_codes
        .map(|csv| {
            csv.split(',')
                .filter_map(|s| s.trim().parse::<u16>().ok())
                .collect::<HashSet<_>>()
        })
        .filter(|set| !set.is_empty());
    let url_pattern = q.url_pattern.as_deref().map(compile_pattern).transpose()?;

    let filter = NetworkFilter {
        methods,
        status_codes,
        url_pattern,
        start_time: q.start_time,
        end_time: q.end_time,
        max: q.max_requests,
        include_response_body: q.include_response_body,
    };
    let requests = state.store.query_network(&id, &filter).await;
    let total_count = requests.len();
    Ok(envelope(json!({ "requests": requests, "totalCount": total_count })))
}

// ─── GET /api/health, GET /api/health/:id ───────────────────────────────────

pub async fn health() -> impl IntoResponse {
    envelope(json!({ "status": "healthy" }))
}

pub async fn health_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ProxyResult<impl IntoResponse> {
    require_valid_id(&id)?;
    let detail = state
        .health_monitor
        .detail(&id)
        .await
        .ok_or_else(|| ProxyError::NotFound(format!("no health record for {id}")))?;
    Ok(envelope(detail))
}

// ─── GET /api/status ─────────────────────────────────────────────────────────

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let (console_total, network_total) = state.store.totals().await;
    let executor_metrics = state.executor.metrics().await;
    let aggregate = state.health_monitor.aggregate().await;
    let rss = read_rss_bytes();

    let started_at_rfc3339 = chrono::DateTime::from_timestamp_millis(state.started_at_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    envelope(json!({
        "startedAt": started_at_rfc3339,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "connectionCount": state.pool.count().await,
        "memory": {
            "rssBytes": rss,
            "rssHuman": crate::observability::format_bytes(rss),
            "consoleEntries": console_total,
            "networkEntries": network_total,
        },
        "executor": executor_metrics,
        "health": aggregate,
    }))
}

/// Best-effort resident set size, read from `/proc/self/statm` on Linux.
/// Unavailable elsewhere — returns 0 rather than failing the whole response.
fn read_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(str::to_string))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

// ─── GET /metrics ────────────────────────────────────────────────────────────

pub async fn metrics(State(state): State<AppState>) -> Response {
    let m = state.executor.metrics().await;
    let aggregate = state.health_monitor.aggregate().await;
    let total_upstreams = aggregate.get("total").and_then(Value::as_u64).unwrap_or(0);
    let healthy_upstreams = aggregate.get("healthy").and_then(Value::as_u64).unwrap_or(0);

    let mut out = String::new();
    out.push_str("# HELP cdpd_commands_total Total CDP commands executed via the HTTP execute path.\n");
    out.push_str("# TYPE cdpd_commands_total counter\n");
    out.push_str(&format!("cdpd_commands_total {}\n", m.total));
    out.push_str("# HELP cdpd_commands_failed_total Failed CDP commands, including timeouts.\n");
    out.push_str("# TYPE cdpd_commands_failed_total counter\n");
    out.push_str(&format!("cdpd_commands_failed_total {}\n", m.failed));
    out.push_str("# HELP cdpd_command_timeouts_total Commands that exceeded their timeout.\n");
    out.push_str("# TYPE cdpd_command_timeouts_total counter\n");
    out.push_str(&format!("cdpd_command_timeouts_total {}\n", m.timeouts));
    out.push_str("# HELP cdpd_command_execution_ms_avg Running average command execution time.\n");
    out.push_str("# TYPE cdpd_command_execution_ms_avg gauge\n");
    out.push_str(&format!("cdpd_command_execution_ms_avg {}\n", m.average_execution_ms));
    out.push_str("# HELP cdpd_requests_in_flight Commands currently awaiting a response.\n");
    out.push_str("# TYPE cdpd_requests_in_flight gauge\n");
    out.push_str(&format!("cdpd_requests_in_flight {}\n", state.executor.requests_in_flight()));
    out.push_str("# HELP cdpd_upstreams_total Known upstream CDP connections.\n");
    out.push_str("# TYPE cdpd_upstreams_total gauge\n");
    out.push_str(&format!("cdpd_upstreams_total {total_upstreams}\n"));
    out.push_str("# HELP cdpd_upstreams_healthy Upstream CDP connections currently healthy.\n");
    out.push_str("# TYPE cdpd_upstreams_healthy gauge\n");
    out.push_str(&format!("cdpd_upstreams_healthy {healthy_upstreams}\n"));

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        out,
    )
        .into_response()
}

// ─── GET /ws/:id ─────────────────────────────────────────────────────────────

pub async fn ws_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    state.touch();
    if !is_valid_connection_id(&id) {
        return (StatusCode::BAD_REQUEST, envelope_err(ProxyError::BadRequest(format!("malformed connection id {id}")))).into_response();
    }
    match state.pool.is_healthy(&id).await {
        Ok(true) => {}
        Ok(false) | Err(ProxyError::UpstreamUnavailable(_)) => {
            return ws
                .on_upgrade(move |mut socket| async move {
                    use axum::extract::ws::{CloseFrame, Message};
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: crate::ws_proxy::upstream_failure_close_code(),
                            reason: "upstream unhealthy".into(),
                        })))
                        .await;
                })
                .into_response();
        }
        Err(_) => {
            return ws
                .on_upgrade(move |mut socket| async move {
                    use axum::extract::ws::{CloseFrame, Message};
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: crate::ws_proxy::policy_close_code(),
                            reason: "unknown connection id".into(),
                        })))
                        .await;
                })
                .into_response();
        }
    }

    let pool = state.pool.clone();
    ws.on_upgrade(move |socket| crate::ws_proxy::run(socket, id, pool))
}

fn envelope_err(err: ProxyError) -> Json<Value> {
    Json(json!({
        "success": false,
        "error": { "code": err.status_code().as_u16(), "message": err.to_string() },
        "timestamp": now_ms(),
    }))
}
