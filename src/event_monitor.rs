// SPDX-License-Identifier: MIT
//! Frame classification and CDP event archival (§4.3).
//!
//! Pure(ish) helpers used by the [`crate::connection_pool`] upstream actor:
//! classifying raw frames off the wire as responses vs. events, and folding
//! the six event types we care about into [`MessageStore`].

use serde_json::Value;
use tracing::trace;

use crate::message_store::MessageStore;
use crate::model::{format_args, ConnectionId, ConsoleEntry, ConsoleLevel, ConsoleSource, NetworkEntry, NetworkPatch, StackFrame};

/// CDP domains enabled on every upstream at attach time. `required = true`
/// means failure to enable aborts the connect; optional domains are logged
/// and tolerated (§4.3, §9 open question c: default to degrade and log).
pub const DOMAINS: &[(&str, bool)] = &[("Runtime", true), ("Log", false), ("Network", false)];

/// A raw frame off the upstream's single message stream, classified per §4.3.
pub enum Frame {
    /// Has `id` and (`result` or `error`) — routed by id.
    Response { id: i64, result: Option<Value>, error: Option<Value> },
    /// Has `method` and no `id` — dispatched by method name.
    Event { method: String, params: Value },
}

/// Classify a raw JSON frame from the upstream. Frames matching neither
/// shape (malformed or unrecognized) return `None` and are ignored.
pub fn classify(raw: &Value) -> Option<Frame> {
    let obj = raw.as_object()?;
    if let Some(id) = obj.get("id").and_then(Value::as_i64) {
        if obj.contains_key("result") || obj.contains_key("error") {
            return Some(Frame::Response {
                id,
                result: obj.get("result").cloned(),
                error: obj.get("error").cloned(),
            });
        }
    }
    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        if !obj.contains_key("id") {
            return Some(Frame::Event {
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
            });
        }
    }
    None
}

/// Archive a classified event into [`MessageStore`] per the mapping in §4.3.
/// Unknown event methods are ignored (pass through without archiving).
pub async fn archive_event(store: &MessageStore, connection_id: &ConnectionId, method: &str, params: &Value) {
    match method {
        "Runtime.consoleAPICalled" => {
            let level = params.get("type").and_then(Value::as_str).unwrap_or("log");
            let args: Vec<Value> = params
                .get("args")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let stack = parse_stack(params);
            store
                .append_console(ConsoleEntry {
                    connection_id: connection_id.clone(),
                    level: ConsoleLevel::normalize(level),
                    text: format_args(&args),
                    args,
                    timestamp: params
                        .get("timestamp")
                        .and_then(Value::as_f64)
                        .map(|t| t as i64)
                        .unwrap_or_else(crate::model::now_ms),
                    stack,
                    source: ConsoleSource::ConsoleApi,
                })
                .await;
        }
        "Log.entryAdded" => {
            let entry = params.get("entry").cloned().unwrap_or(Value::Null);
            let level = entry.get("level").and_then(Value::as_str).unwrap_or("log");
            let text = entry
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            store
                .append_console(ConsoleEntry {
                    connection_id: connection_id.clone(),
                    level: ConsoleLevel::normalize(level),
                    text,
                    args: Vec::new(),
                    timestamp: entry
                        .get("timestamp")
                        .and_then(Value::as_f64)
                        .map(|t| t as i64)
                        .unwrap_or_else(crate::model::now_ms),
                    stack: parse_stack(&entry),
                    source: ConsoleSource::LogEntry,
                })
                .await;
        }
        "Network.requestWillBeSent" => {
            let request_id = params.get("requestId").and_then(Value::as_str).unwrap_or_default();
            let request = params.get("request").cloned().unwrap_or(Value::Null);
            let headers = request
                .get("headers")
                .and_then(Value::as_object)
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                })
                .unwrap_or_default();
            store
                .append_network(NetworkEntry {
                    connection_id: connection_id.clone(),
                    request_id: request_id.to_string(),
                    url: request.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                    method: request.get("method").and_then(Value::as_str).unwrap_or_default().to_string(),
                    request_headers: headers,
                    timestamp: params
                        .get("wallTime")
                        .and_then(Value::as_f64)
                        .map(|t| (t * 1000.0) as i64)
                        .unwrap_or_else(crate::model::now_ms),
                    status: None,
                    response_headers: None,
                    response_body: None,
                    loading_finished: false,
                })
                .await;
        }
        "Network.responseReceived" => {
            let request_id = params.get("requestId").and_then(Value::as_str).unwrap_or_default();
            let response = params.get("response").cloned().unwrap_or(Value::Null);
            let headers = response
                .get("headers")
                .and_then(Value::as_object)
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                        .collect()
                });
            let status = response.get("status").and_then(Value::as_u64).map(|s| s as u16);
            store
                .update_network(
                    connection_id,
                    request_id,
                    NetworkPatch {
                        status,
                        response_headers: headers,
                        ..Default::default()
                    },
                )
                .await;
        }
        "Network.loadingFinished" => {
            let request_id = params.get("requestId").and_then(Value::as_str).unwrap_or_default();
            store
                .update_network(
                    connection_id,
                    request_id,
                    NetworkPatch {
                        loading_finished: Some(true),
                        ..Default::default()
                    },
                )
                .await;
        }
        "Network.loadingFailed" => {
            let request_id = params.get("requestId").and_then(Value::as_str).unwrap_or_default();
            store
                .update_network(
                    connection_id,
                    request_id,
                    NetworkPatch {
                        status: Some(0),
                        loading_finished: Some(true),
                        ..Default::default()
                    },
                )
                .await;
        }
        other => {
            trace!(method = other, "unrecognized CDP event method — ignored");
        }
    }
}

fn parse_stack(params: &Value) -> Option<Vec<StackFrame>> {
    let frames = params.get("stackTrace")?.get("callFrames")?.as_array()?;
    Some(
        frames
            .iter()
            .map(|f| StackFrame {
                function_name: f.get("functionName").and_then(Value::as_str).unwrap_or_default().to_string(),
                url: f.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                line_number: f.get("lineNumber").and_then(Value::as_i64).unwrap_or_default(),
                column_number: f.get("columnNumber").and_then(Value::as_i64).unwrap_or_default(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_store::ConsoleFilter;
    use serde_json::json;

    #[test]
    fn classify_response_vs_event() {
        let resp = json!({"id": 1, "result": {}});
        assert!(matches!(classify(&resp), Some(Frame::Response { id: 1, .. })));

        let event = json!({"method": "Runtime.consoleAPICalled", "params": {}});
        assert!(matches!(classify(&event), Some(Frame::Event { .. })));

        let garbage = json!({"foo": "bar"});
        assert!(classify(&garbage).is_none());
    }

    #[tokio::test]
    async fn console_api_called_archives_and_normalizes_level() {
        let store = MessageStore::new(100, 100);
        let params = json!({
            "type": "warning",
            "args": [{"type": "string", "value": "hi"}],
            "timestamp": 1234.0,
        });
        archive_event(&store, &"c1".to_string(), "Runtime.consoleAPICalled", &params).await;
        let entries = store.query_console("c1", &ConsoleFilter::default()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, ConsoleLevel::Warn);
        assert_eq!(entries[0].text, "hi");
    }

    #[tokio::test]
    async fn network_lifecycle_updates_in_place() {
        let store = MessageStore::new(100, 100);
        let id = "c1".to_string();
        archive_event(
            &store,
            &id,
            "Network.requestWillBeSent",
            &json!({"requestId": "R1", "request": {"url": "https://x", "method": "GET"}}),
        )
        .await;
        archive_event(
            &store,
            &id,
            "Network.loadingFailed",
            &json!({"requestId": "R1"}),
        )
        .await;
        let entries = store
            .query_network("c1", &crate::message_store::NetworkFilter::default())
            .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, Some(0));
        assert!(entries[0].loading_finished);
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let store = MessageStore::new(100, 100);
        archive_event(&store, &"c1".to_string(), "Page.frameNavigated", &json!({})).await;
        assert!(store.query_console("c1", &ConsoleFilter::default()).await.is_empty());
    }
}
