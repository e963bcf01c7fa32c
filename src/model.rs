// SPDX-License-Identifier: MIT
//! Core data types shared across the proxy: connection identity, console and
//! network history entries, and the API response envelope (§3).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static CONNECTION_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Milliseconds since the Unix epoch, matching CDP's own timestamp convention.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Opaque handle returned to clients for an upstream. Matches `[A-Za-z0-9_-]+`.
pub type ConnectionId = String;

/// Mint a fresh [`ConnectionId`]. UUID v4 in simple (no-hyphen) form so the
/// result trivially satisfies the API's `[A-Za-z0-9_-]+` shape requirement.
pub fn new_connection_id() -> ConnectionId {
    Uuid::new_v4().simple().to_string()
}

/// Validate a [`ConnectionId`] shape per §6: opaque string, `[A-Za-z0-9_-]+`.
pub fn is_valid_connection_id(s: &str) -> bool {
    CONNECTION_ID_PATTERN.is_match(s)
}

/// `(host, port, targetId)` — the dedupe key for an upstream CDP connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub target_id: String,
}

impl ConnectionKey {
    pub fn new(host: impl Into<String>, port: u16, target_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            target_id: target_id.into(),
        }
    }
}

/// A CDP debugging target as returned by `GET /json/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: String,
}

/// Console message severity, normalized per §4.1: CDP `warning` → `warn`,
/// `verbose` → `info`, unknown levels → `log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    /// Normalize a CDP-reported level string into our fixed vocabulary.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "warning" => ConsoleLevel::Warn,
            "warn" => ConsoleLevel::Warn,
            "verbose" => ConsoleLevel::Info,
            "info" => ConsoleLevel::Info,
            "error" => ConsoleLevel::Error,
            "debug" => ConsoleLevel::Debug,
            "log" => ConsoleLevel::Log,
            _ => ConsoleLevel::Log,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

/// Where a [`ConsoleEntry`] was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsoleSource {
    ConsoleApi,
    LogEntry,
}

/// A single stack frame, as reported by CDP's `stackTrace.callFrames`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
}

/// One archived console message (§3).
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEntry {
    pub connection_id: ConnectionId,
    #[serde(rename = "type")]
    pub level: ConsoleLevel,
    pub text: String,
    pub args: Vec<serde_json::Value>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<StackFrame>>,
    pub source: ConsoleSource,
}

/// One archived network request/response pair (§3).
#[derive(Debug, Clone, Serialize)]
pub struct NetworkEntry {
    pub connection_id: ConnectionId,
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub request_headers: HashMap<String, String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub loading_finished: bool,
}

/// Fields that later CDP network events patch onto an existing [`NetworkEntry`]
/// (§4.1 `updateNetwork`).
#[derive(Debug, Clone, Default)]
pub struct NetworkPatch {
    pub status: Option<u16>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
    pub loading_finished: Option<bool>,
}

/// Concatenate `Runtime.consoleAPICalled` args into display text per §4.1:
/// strings verbatim, everything else JSON-encoded, space separated.
pub fn format_args(args: &[serde_json::Value]) -> String {
    args.iter()
        .map(|v| match v.get("value") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => v.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Every HTTP API response is wrapped in this envelope (§6).
#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: u16,
    pub message: String,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_ms(),
        }
    }
}
