// SPDX-License-Identifier: MIT
//! Downstream WebSocket proxy: accepts short-lived client sockets keyed by
//! connection id, forwards their commands upstream, and fans out archived
//! events with per-client filters (§4.5).

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::connection_pool::ConnectionPool;
use crate::error::ProxyError;
use crate::model::now_ms;

/// Close code for normal closure (§6).
const CLOSE_NORMAL: u16 = 1000;
/// Close code for a handshake policy violation: missing/unknown connection id.
const CLOSE_POLICY: u16 = 1008;
/// Close code when the upstream is unhealthy at handshake time.
const CLOSE_UPSTREAM_FAILURE: u16 = 1011;

/// A downstream WebSocket client's state machine (§4.5): `Handshaking` is
/// everything before this function is called (the router's upgrade dance),
/// `Open` is the body of [`run`], `Closed` is falling out of it.
struct ClientProxy {
    proxy_id: String,
    connection_id: String,
    created_at_ms: i64,
    message_count: u64,
    /// Empty ⇒ receive all events (§4.5 `Proxy.setEventFilters`).
    filters: HashSet<String>,
    /// CDP message ids this client has sent upstream, so responses broadcast
    /// on the shared `ws_responses` channel are routed only to their author.
    own_pending: HashSet<i64>,
}

/// Validate a client-authored CDP command's shape per §4.5. The returned
/// error's `json_rpc_code()` is what's reported to the client.
fn validate_command_shape(raw: &Value) -> Result<(), ProxyError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ProxyError::InvalidRequest("expected a JSON object".into()))?;
    match obj.get("method") {
        Some(Value::String(_)) => {}
        _ => return Err(ProxyError::InvalidRequest("missing or non-string method".into())),
    }
    if let Some(id) = obj.get("id") {
        if !(id.is_number() || id.is_string()) {
            return Err(ProxyError::InvalidRequest("id must be a number or string".into()));
        }
    }
    if let Some(params) = obj.get("params") {
        if !params.is_object() {
            return Err(ProxyError::InvalidRequest("params must be an object".into()));
        }
    }
    Ok(())
}

fn jsonrpc_error(id: Option<&Value>, code: i64, message: &str) -> Message {
    Message::Text(
        json!({
            "id": id.cloned().unwrap_or(Value::Null),
            "error": { "code": code, "message": message },
        })
        .to_string()
        .into(),
    )
}

fn jsonrpc_result(id: Option<&Value>, result: Value) -> Message {
    Message::Text(
        json!({ "id": id.cloned().unwrap_or(Value::Null), "result": result }).to_string().into(),
    )
}

/// Drive a single accepted downstream WebSocket for the lifetime of the
/// connection. The handshake (connection id presence/validity/health) has
/// already been resolved by the caller in `src/api.rs`.
pub async fn run(mut socket: WebSocket, connection_id: String, pool: Arc<ConnectionPool>) {
    let proxy_id = Uuid::new_v4().simple().to_string();
    let mut client = ClientProxy {
        proxy_id: proxy_id.clone(),
        connection_id: connection_id.clone(),
        created_at_ms: now_ms(),
        message_count: 0,
        filters: HashSet::new(),
        own_pending: HashSet::new(),
    };

    let connected = json!({
        "type": "proxy-connected",
        "proxyId": client.proxy_id,
        "connectionId": client.connection_id,
        "timestamp": client.created_at_ms,
    });
    if socket.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    let _ = pool.increment_clients(&connection_id).await;
    debug!(connection_id = %connection_id, proxy_id = %client.proxy_id, "client attached");

    let mut events = match pool.subscribe_events(&connection_id).await {
        Ok(rx) => rx,
        Err(_) => {
            close_with(&mut socket, CLOSE_UPSTREAM_FAILURE, "upstream unavailable").await;
            return;
        }
    };
    let mut ws_responses = match pool.subscribe_ws_responses(&connection_id).await {
        Ok(rx) => rx,
        Err(_) => {
            close_with(&mut socket, CLOSE_UPSTREAM_FAILURE, "upstream unavailable").await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        client.message_count += 1;
                        if let Some(reply) = handle_client_frame(&text, &mut client, &pool).await {
                            if socket.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        trace!(connection_id = %connection_id, error = %e, "client socket error");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Ok(frame) => {
                        if client.filters.is_empty() || client.filters.contains(&frame.method) {
                            let payload = json!({ "method": frame.method, "params": frame.params });
                            if socket.send(Message::Text(payload.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection_id = %connection_id, skipped = n, "client lagged behind event fan-out");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            resp = ws_responses.recv() => {
                match resp {
                    Ok(raw) => {
                        if let Some(id) = raw.get("id").and_then(Value::as_i64) {
                            if client.own_pending.remove(&id) {
                                if socket.send(Message::Text(raw.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection_id = %connection_id, skipped = n, "client lagged behind response routing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    pool.decrement_clients(&connection_id).await;
    debug!(connection_id = %connection_id, proxy_id = %client.proxy_id, messages = client.message_count, "client detached");
}

async fn handle_client_frame(text: &str, client: &mut ClientProxy, pool: &ConnectionPool) -> Option<Message> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let err = ProxyError::ParseError(e.to_string());
            return Some(jsonrpc_error(None, err.json_rpc_code(), &err.to_string()));
        }
    };

    if let Err(err) = validate_command_shape(&raw) {
        return Some(jsonrpc_error(raw.get("id"), err.json_rpc_code(), &err.to_string()));
    }

    let id = raw.get("id").cloned();
    let method = raw.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = raw.get("params").cloned().unwrap_or(Value::Null);

    if let Some(stripped) = method.strip_prefix("Proxy.") {
        return Some(handle_proxy_method(stripped, id.as_ref(), params, client, pool).await);
    }

    if let Some(numeric_id) = raw.get("id").and_then(Value::as_i64) {
        client.own_pending.insert(numeric_id);
    }
    match pool.send_raw(&client.connection_id, raw).await {
        Ok(()) => None,
        Err(e) => Some(jsonrpc_error(id.as_ref(), e.json_rpc_code(), &e.to_string())),
    }
}

async fn handle_proxy_method(
    method: &str,
    id: Option<&Value>,
    params: Value,
    client: &mut ClientProxy,
    pool: &ConnectionPool,
) -> Message {
    match method {
        "setEventFilters" => {
            let methods: Vec<String> = params
                .get("eventMethods")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            client.filters = methods.into_iter().collect();
            jsonrpc_result(id, json!({ "eventMethods": client.filters }))
        }
        "clearEventFilters" => {
            client.filters.clear();
            jsonrpc_result(id, json!({ "eventMethods": [] as [String; 0] }))
        }
        "getEventFilters" => jsonrpc_result(id, json!({ "eventMethods": client.filters })),
        "getStatus" => {
            let healthy = pool.is_healthy(&client.connection_id).await.unwrap_or(false);
            let client_count = pool
                .summary(&client.connection_id)
                .await
                .map(|s| s.client_count)
                .unwrap_or(0);
            jsonrpc_result(
                id,
                json!({
                    "proxyId": client.proxy_id,
                    "connectionId": client.connection_id,
                    "messageCount": client.message_count,
                    "createdAt": client.created_at_ms,
                    "healthy": healthy,
                    "clientCount": client_count,
                }),
            )
        }
        other => {
            let err = ProxyError::NotFound(format!("unknown proxy method Proxy.{other}"));
            jsonrpc_error(id, err.json_rpc_code(), &err.to_string())
        }
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

pub const fn normal_close_code() -> u16 {
    CLOSE_NORMAL
}
pub const fn policy_close_code() -> u16 {
    CLOSE_POLICY
}
pub const fn upstream_failure_close_code() -> u16 {
    CLOSE_UPSTREAM_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_missing_method() {
        let err = validate_command_shape(&json!({"id": 1})).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32600);
    }

    #[test]
    fn validates_bad_id_type() {
        let raw = json!({"method": "Runtime.evaluate", "id": {}});
        let err = validate_command_shape(&raw).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32600);
    }

    #[test]
    fn validates_bad_params_type() {
        let raw = json!({"method": "Runtime.evaluate", "params": "nope"});
        let err = validate_command_shape(&raw).unwrap_err();
        assert_eq!(err.json_rpc_code(), -32600);
    }

    #[test]
    fn accepts_well_formed_command() {
        let raw = json!({"method": "Runtime.evaluate", "id": 1, "params": {}});
        assert_eq!(validate_command_shape(&raw), Ok(()));
    }
}
