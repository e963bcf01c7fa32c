// SPDX-License-Identifier: MIT
//! Lifecycle of upstream CDP WebSockets: discovery, key-based dedupe, health,
//! reconnect with backoff, idle reap (§4.2).
//!
//! Each upstream is owned by a dedicated task (the "actor") that serializes
//! all reads and writes to its WebSocket, mirroring the dedicated-connection
//! worker pattern used elsewhere in this codebase for long-lived sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::event_monitor::{self, Frame};
use crate::message_store::MessageStore;
use crate::model::{new_connection_id, ConnectionId, ConnectionKey, TargetInfo};

/// Dispatch ids reserved for [`crate::command_executor::CommandExecutor`].
pub const COMMAND_ID_MAX: i64 = 999_999;
/// Dispatch ids reserved for the in-actor CDP domain-enable sequence.
const DOMAIN_ENABLE_ID_BASE: i64 = 1_000_000;
const DOMAIN_ENABLE_ID_MAX: i64 = 1_999_999;
/// Dispatch ids reserved for [`crate::health_monitor`] probes — strictly
/// above both other ranges so no generator can ever alias another's response
/// (§9 open question a).
const HEALTH_CHECK_ID_MIN: i64 = 2_000_000;

/// One CDP event, fanned out to subscribed [`crate::ws_proxy`] clients.
#[derive(Debug, Clone)]
pub struct EventFrame {
    pub method: String,
    pub params: Value,
}

/// A point-in-time summary of an upstream, for `/api/connections` and friends.
#[derive(Debug, Clone)]
pub struct UpstreamSummary {
    pub connection_id: ConnectionId,
    pub host: String,
    pub port: u16,
    pub target_id: String,
    pub created_at_ms: i64,
    pub healthy: bool,
    pub client_count: usize,
    pub reconnect_attempts: u32,
    pub permanently_failed: bool,
}

enum ActorCommand {
    /// An internally-correlated dispatch (CommandExecutor or HealthMonitor).
    Dispatch {
        id: i64,
        method: String,
        params: Value,
        respond_to: oneshot::Sender<ProxyResult<Value>>,
    },
    /// A client-authored WS frame, forwarded verbatim with no local tracking.
    SendRaw { frame: Value },
    ForceReconnect,
    Shutdown,
}

struct UpstreamRecord {
    connection_id: ConnectionId,
    key: ConnectionKey,
    ws_url: String,
    target_info: TargetInfo,
    created_at: Instant,
    created_at_ms: i64,
    last_used: Mutex<Instant>,
    client_count: AtomicUsize,
    healthy: AtomicBool,
    reconnect_attempts: AtomicU32,
    permanently_failed: AtomicBool,
    cmd_tx: mpsc::Sender<ActorCommand>,
    events_tx: broadcast::Sender<Arc<EventFrame>>,
    ws_responses_tx: broadcast::Sender<Arc<Value>>,
}

impl UpstreamRecord {
    async fn touch(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    fn summary(&self) -> UpstreamSummary {
        UpstreamSummary {
            connection_id: self.connection_id.clone(),
            host: self.key.host.clone(),
            port: self.key.port,
            target_id: self.key.target_id.clone(),
            created_at_ms: self.created_at_ms,
            healthy: self.healthy.load(Ordering::Relaxed) && !self.permanently_failed.load(Ordering::Relaxed),
            client_count: self.client_count.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle manager for upstream CDP WebSockets.
pub struct ConnectionPool {
    config: Arc<ProxyConfig>,
    store: Arc<MessageStore>,
    http: reqwest::Client,
    records: RwLock<HashMap<ConnectionKey, Arc<UpstreamRecord>>>,
    by_id: RwLock<HashMap<ConnectionId, ConnectionKey>>,
    /// Serializes the discover-then-create sequence so two racing
    /// `getOrCreate` calls for the same key never open two sockets.
    creation_lock: Mutex<()>,
}

impl ConnectionPool {
    pub fn new(config: Arc<ProxyConfig>, store: Arc<MessageStore>) -> Self {
        Self {
            config,
            store,
            http: reqwest::Client::new(),
            records: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            creation_lock: Mutex::new(()),
        }
    }

    /// `GET http://host:port/json/list`.
    async fn discover(&self, host: &str, port: u16) -> ProxyResult<Vec<TargetInfo>> {
        let url = format!("http://{host}:{port}/json/list");
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.connect_timeout())
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("target discovery failed: {e}")))?;
        resp.json::<Vec<TargetInfo>>()
            .await
            .map_err(|e| ProxyError::UpstreamUnavailable(format!("malformed /json/list response: {e}")))
    }

    fn select_target(targets: &[TargetInfo], target_id: Option<&str>) -> ProxyResult<TargetInfo> {
        match target_id {
            Some(id) => targets
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| ProxyError::NotFound(format!("no target with id {id}"))),
            None => targets
                .iter()
                .find(|t| t.target_type == "page")
                .cloned()
                .ok_or_else(|| ProxyError::NotFound("no debuggable page target found".to_string())),
        }
    }

    /// `getOrCreate(host, port, targetId?)` (§4.2).
    pub async fn get_or_create(
        &self,
        host: &str,
        port: u16,
        target_id: Option<&str>,
    ) -> ProxyResult<(ConnectionId, TargetInfo, bool)> {
        let _guard = self.creation_lock.lock().await;

        let targets = self.discover(host, port).await?;
        let target = Self::select_target(&targets, target_id)?;
        let key = ConnectionKey::new(host, port, target.id.clone());

        let existing = self.records.read().await.get(&key).cloned();
        if let Some(record) = existing {
            if !record.permanently_failed.load(Ordering::Relaxed) {
                record.client_count.fetch_add(1, Ordering::Relaxed);
                record.touch().await;
                return Ok((record.connection_id.clone(), target, false));
            }
            debug!(connection_id = %record.connection_id, "replacing permanently failed upstream");
            self.close_locked(&key).await;
        }

        let connection_id = new_connection_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(1024);
        let (ws_responses_tx, _) = broadcast::channel(1024);

        let record = Arc::new(UpstreamRecord {
            connection_id: connection_id.clone(),
            key: key.clone(),
            ws_url: target.web_socket_debugger_url.clone(),
            target_info: target.clone(),
            created_at: Instant::now(),
            created_at_ms: crate::model::now_ms(),
            last_used: Mutex::new(Instant::now()),
            client_count: AtomicUsize::new(1),
            healthy: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            permanently_failed: AtomicBool::new(false),
            cmd_tx,
            events_tx,
            ws_responses_tx,
        });

        self.records.write().await.insert(key.clone(), record.clone());
        self.by_id.write().await.insert(connection_id.clone(), key.clone());

        tokio::spawn(run_upstream_actor(
            key,
            self.config.clone(),
            self.store.clone(),
            record.clone(),
            cmd_rx,
        ));

        self.wait_for_initial_health(&record).await?;
        info!(connection_id = %connection_id, host, port, target_id = %target.id, "upstream connected");
        Ok((connection_id, target, true))
    }

    async fn wait_for_initial_health(&self, record: &Arc<UpstreamRecord>) -> ProxyResult<()> {
        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            if record.healthy.load(Ordering::Relaxed) {
                return Ok(());
            }
            if record.permanently_failed.load(Ordering::Relaxed) {
                return Err(ProxyError::UpstreamUnavailable(
                    "failed to establish upstream connection".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::Timeout("upstream connect timed out".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn record_for(&self, connection_id: &str) -> ProxyResult<Arc<UpstreamRecord>> {
        let by_id = self.by_id.read().await;
        let key = by_id
            .get(connection_id)
            .ok_or_else(|| ProxyError::NotFound(format!("unknown connection id {connection_id}")))?;
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("unknown connection id {connection_id}")))
    }

    pub async fn is_healthy(&self, connection_id: &str) -> ProxyResult<bool> {
        let record = self.record_for(connection_id).await?;
        Ok(record.healthy.load(Ordering::Relaxed) && !record.permanently_failed.load(Ordering::Relaxed))
    }

    /// Generic internally-correlated dispatch, used by both CommandExecutor
    /// (ids ≤ [`COMMAND_ID_MAX`]) and HealthMonitor (ids ≥ [`HEALTH_CHECK_ID_MIN`]).
    pub async fn dispatch(
        &self,
        connection_id: &str,
        id: i64,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> ProxyResult<Value> {
        let record = self.record_for(connection_id).await?;
        if !record.healthy.load(Ordering::Relaxed) {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "connection {connection_id} is not healthy"
            )));
        }
        record.touch().await;

        let (respond_to, rx) = oneshot::channel();
        record
            .cmd_tx
            .send(ActorCommand::Dispatch {
                id,
                method: method.to_string(),
                params,
                respond_to,
            })
            .await
            .map_err(|_| ProxyError::UpstreamUnavailable("upstream actor is gone".to_string()))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::UpstreamUnavailable("connection closed".to_string())),
            Err(_) => Err(ProxyError::Timeout(format!("{method} timed out after {timeout:?}"))),
        }
    }

    /// Forward a raw, client-authored frame upstream with no local tracking
    /// (WS proxy path — correlation is the client's own responsibility).
    pub async fn send_raw(&self, connection_id: &str, frame: Value) -> ProxyResult<()> {
        let record = self.record_for(connection_id).await?;
        if !record.healthy.load(Ordering::Relaxed) {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "connection {connection_id} is not healthy"
            )));
        }
        record.touch().await;
        record
            .cmd_tx
            .send(ActorCommand::SendRaw { frame })
            .await
            .map_err(|_| ProxyError::UpstreamUnavailable("upstream actor is gone".to_string()))
    }

    pub async fn subscribe_events(&self, connection_id: &str) -> ProxyResult<broadcast::Receiver<Arc<EventFrame>>> {
        Ok(self.record_for(connection_id).await?.events_tx.subscribe())
    }

    pub async fn subscribe_ws_responses(&self, connection_id: &str) -> ProxyResult<broadcast::Receiver<Arc<Value>>> {
        Ok(self.record_for(connection_id).await?.ws_responses_tx.subscribe())
    }

    pub async fn increment_clients(&self, connection_id: &str) -> ProxyResult<()> {
        let record = self.record_for(connection_id).await?;
        record.client_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn decrement_clients(&self, connection_id: &str) {
        if let Ok(record) = self.record_for(connection_id).await {
            record.client_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// `healthCheck(ConnectionID)` (§4.2): a `Runtime.evaluate` round trip on
    /// a high-entropy id disjoint from every other dispatch range.
    pub async fn health_check(&self, connection_id: &str) -> ProxyResult<()> {
        let id = rand::thread_rng().gen_range(HEALTH_CHECK_ID_MIN..i64::MAX);
        self.dispatch(
            connection_id,
            id,
            "Runtime.evaluate",
            json!({"expression": "1+1", "returnByValue": true}),
            self.config.health_check_timeout(),
        )
        .await
        .map(|_| ())
    }

    pub async fn force_reconnect(&self, connection_id: &str) -> ProxyResult<()> {
        let record = self.record_for(connection_id).await?;
        record
            .cmd_tx
            .send(ActorCommand::ForceReconnect)
            .await
            .map_err(|_| ProxyError::UpstreamUnavailable("upstream actor is gone".to_string()))
    }

    /// `close(ConnectionID)` (§4.2).
    pub async fn close(&self, connection_id: &str) -> ProxyResult<()> {
        let key = self
            .by_id
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("unknown connection id {connection_id}")))?;
        self.close_locked(&key).await;
        Ok(())
    }

    async fn close_locked(&self, key: &ConnectionKey) {
        let record = self.records.write().await.remove(key);
        if let Some(record) = &record {
            self.by_id.write().await.remove(&record.connection_id);
            let _ = record.cmd_tx.send(ActorCommand::Shutdown).await;
            self.store.cleanup(&record.connection_id).await;
        }
    }

    /// `cleanupUnused(maxIdleMs)` (§4.2), run from the periodic sweep.
    pub async fn cleanup_unused(&self, max_idle: Duration) {
        let candidates: Vec<ConnectionKey> = {
            let records = self.records.read().await;
            let mut out = Vec::new();
            for (key, record) in records.iter() {
                if record.client_count.load(Ordering::Relaxed) == 0 {
                    let idle = record.last_used.lock().await.elapsed();
                    if idle > max_idle {
                        out.push(key.clone());
                    }
                }
            }
            out
        };
        for key in candidates {
            info!(?key, "closing idle upstream");
            self.close_locked(&key).await;
        }
    }

    pub async fn list(&self) -> Vec<UpstreamSummary> {
        self.records.read().await.values().map(|r| r.summary()).collect()
    }

    pub async fn summary(&self, connection_id: &str) -> ProxyResult<UpstreamSummary> {
        Ok(self.record_for(connection_id).await?.summary())
    }

    pub async fn target_info(&self, connection_id: &str) -> ProxyResult<TargetInfo> {
        Ok(self.record_for(connection_id).await?.target_info.clone())
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Explicit disconnect and permanent-failure both affect the lease held
    /// by CommandExecutor, but ownership bookkeeping itself lives there.
    pub async fn shutdown_all(&self) {
        let keys: Vec<ConnectionKey> = self.records.read().await.keys().cloned().collect();
        for key in keys {
            self.close_locked(&key).await;
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_with_timeout(url: &str, timeout: Duration) -> anyhow::Result<WsStream> {
    let (socket, _resp) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await??;
    Ok(socket)
}

/// Backoff with ±10% jitter, `base · 2^attempts` (§4.2). Returns `false` once
/// `reconnect_max_attempts` is exhausted, marking the record permanently
/// failed; buffers and the record itself are retained per §7.
async fn backoff_or_give_up(record: &UpstreamRecord, config: &ProxyConfig) -> bool {
    let attempt = record.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
    if attempt > config.reconnect_max_attempts {
        warn!(connection_id = %record.connection_id, attempt, "reconnect attempts exhausted, marking permanently failed");
        record.permanently_failed.store(true, Ordering::Relaxed);
        record.healthy.store(false, Ordering::Relaxed);
        return false;
    }
    let base_ms = config.reconnect_base_delay().as_millis() as f64;
    let exp = base_ms * 2f64.powi(attempt as i32 - 1);
    let jitter = rand::thread_rng().gen_range(-0.1..=0.1);
    let delay_ms = (exp * (1.0 + jitter)).max(0.0) as u64;
    debug!(connection_id = %record.connection_id, attempt, delay_ms, "reconnecting after backoff");
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    true
}

async fn fail_all_pending(pending: &mut HashMap<i64, (Instant, oneshot::Sender<ProxyResult<Value>>)>) {
    for (_, (_, tx)) in pending.drain() {
        let _ = tx.send(Err(ProxyError::UpstreamUnavailable("connection closed".to_string())));
    }
}

fn sweep_expired_pending(pending: &mut HashMap<i64, (Instant, oneshot::Sender<ProxyResult<Value>>)>) {
    let now = Instant::now();
    let expired: Vec<i64> = pending
        .iter()
        .filter(|(_, (deadline, _))| now >= *deadline)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(ProxyError::Timeout(format!("message id {id} timed out"))));
        }
    }
}

async fn handle_incoming_text(
    text: &str,
    pending: &mut HashMap<i64, (Instant, oneshot::Sender<ProxyResult<Value>>)>,
    store: &MessageStore,
    connection_id: &ConnectionId,
    record: &UpstreamRecord,
) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "ignoring malformed upstream frame");
            return;
        }
    };
    match event_monitor::classify(&raw) {
        Some(Frame::Response { id, result, error }) => {
            if let Some((_, tx)) = pending.remove(&id) {
                let outcome = match error {
                    Some(err) => Err(ProxyError::Internal(anyhow::anyhow!(
                        "upstream error: {}",
                        err.get("message").and_then(Value::as_str).unwrap_or("unknown")
                    ))),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            } else {
                // Not one of ours — assume a WS-client-forwarded command and
                // let each ClientProxy decide whether the id is theirs.
                let _ = record.ws_responses_tx.send(Arc::new(raw));
            }
        }
        Some(Frame::Event { method, params }) => {
            event_monitor::archive_event(store, connection_id, &method, &params).await;
            let _ = record.events_tx.send(Arc::new(EventFrame { method, params }));
        }
        None => trace!("ignoring unrecognized upstream frame shape"),
    }
}

/// Enable `Runtime`, `Log`, `Network` in order (§4.3). Runs its own
/// read loop so that events arriving interleaved with enable responses are
/// archived immediately rather than dropped or reordered.
async fn enable_domains(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    read: &mut (impl StreamExt<
        Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
    > + Unpin),
    store: &MessageStore,
    connection_id: &ConnectionId,
    record: &UpstreamRecord,
    config: &ProxyConfig,
) -> anyhow::Result<()> {
    let mut next_id = DOMAIN_ENABLE_ID_BASE;
    for (domain, required) in event_monitor::DOMAINS.iter().copied() {
        let id = next_id;
        next_id = (next_id + 1).min(DOMAIN_ENABLE_ID_MAX);
        let method = format!("{domain}.enable");
        let frame = json!({"id": id, "method": method, "params": {}});
        write.send(Message::Text(frame.to_string())).await?;

        let outcome = tokio::time::timeout(config.domain_enable_timeout(), async {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let raw: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        match event_monitor::classify(&raw) {
                            Some(Frame::Response { id: rid, error, .. }) if rid == id => {
                                return Ok(error);
                            }
                            Some(Frame::Event { method, params }) => {
                                event_monitor::archive_event(store, connection_id, &method, &params).await;
                                let _ = record.events_tx.send(Arc::new(EventFrame { method, params }));
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(anyhow::anyhow!("upstream read error: {e}")),
                    None => return Err(anyhow::anyhow!("upstream closed during domain enable")),
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(Some(err))) => {
                let msg = format!("{method} failed: {err}");
                if *required {
                    return Err(anyhow::anyhow!(msg));
                }
                warn!(connection_id = %connection_id, domain, "optional domain enable failed, degrading: {msg}");
            }
            Ok(Ok(None)) => debug!(connection_id = %connection_id, domain, "domain enabled"),
            Ok(Err(e)) => {
                if *required {
                    return Err(e);
                }
                warn!(connection_id = %connection_id, domain, "optional domain enable errored, degrading: {e}");
            }
            Err(_) => {
                let msg = format!("{method} timed out");
                if *required {
                    return Err(anyhow::anyhow!(msg));
                }
                warn!(connection_id = %connection_id, domain, "{msg}, degrading");
            }
        }
    }
    Ok(())
}

async fn run_upstream_actor(
    key: ConnectionKey,
    config: Arc<ProxyConfig>,
    store: Arc<MessageStore>,
    record: Arc<UpstreamRecord>,
    mut cmd_rx: mpsc::Receiver<ActorCommand>,
) {
    let connection_id = record.connection_id.clone();
    let ws_url = record.ws_url.clone();

    'connect: loop {
        let socket = match connect_with_timeout(&ws_url, config.connect_timeout()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "upstream connect failed");
                if !backoff_or_give_up(&record, &config).await {
                    return;
                }
                continue 'connect;
            }
        };

        let (mut write, mut read) = socket.split();
        if let Err(e) = enable_domains(&mut write, &mut read, &store, &connection_id, &record, &config).await {
            warn!(connection_id = %connection_id, error = %e, "domain enable sequence failed");
            let _ = write.close().await;
            if !backoff_or_give_up(&record, &config).await {
                return;
            }
            continue 'connect;
        }

        record.healthy.store(true, Ordering::Relaxed);
        record.reconnect_attempts.store(0, Ordering::Relaxed);
        info!(connection_id = %connection_id, host = %key.host, port = key.port, "upstream attached, domains enabled");

        let mut pending: HashMap<i64, (Instant, oneshot::Sender<ProxyResult<Value>>)> = HashMap::new();
        let mut sweep = tokio::time::interval(Duration::from_secs(1));

        let disconnect_reason = 'session: loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ActorCommand::Shutdown) => {
                            fail_all_pending(&mut pending).await;
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                        Some(ActorCommand::ForceReconnect) => {
                            fail_all_pending(&mut pending).await;
                            let _ = write
                                .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                                    reason: "Reconnecting".into(),
                                })))
                                .await;
                            break 'session None;
                        }
                        Some(ActorCommand::Dispatch { id, method, params, respond_to }) => {
                            let frame = json!({"id": id, "method": method, "params": params});
                            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                let _ = respond_to.send(Err(ProxyError::UpstreamUnavailable(e.to_string())));
                                break 'session Some(anyhow::anyhow!("write failed: {e}"));
                            }
                            let deadline = Instant::now() + config.command_timeout();
                            pending.insert(id, (deadline, respond_to));
                        }
                        Some(ActorCommand::SendRaw { frame }) => {
                            if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                                break 'session Some(anyhow::anyhow!("write failed: {e}"));
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    sweep_expired_pending(&mut pending);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_incoming_text(&text, &mut pending, &store, &connection_id, &record).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break 'session Some(anyhow::anyhow!("upstream closed"));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break 'session Some(anyhow::anyhow!("upstream read error: {e}"));
                        }
                    }
                }
            }
        };

        fail_all_pending(&mut pending).await;
        record.healthy.store(false, Ordering::Relaxed);

        if let Some(reason) = disconnect_reason {
            warn!(connection_id = %connection_id, %reason, "upstream session ended, reconnecting");
        } else {
            debug!(connection_id = %connection_id, "forced reconnect requested");
        }

        if !backoff_or_give_up(&record, &config).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_target_prefers_explicit_id() {
        let targets = vec![
            TargetInfo {
                id: "a".into(),
                title: "A".into(),
                url: "about:blank".into(),
                target_type: "page".into(),
                web_socket_debugger_url: "ws://x/a".into(),
            },
            TargetInfo {
                id: "b".into(),
                title: "B".into(),
                url: "about:blank".into(),
                target_type: "page".into(),
                web_socket_debugger_url: "ws://x/b".into(),
            },
        ];
        let picked = ConnectionPool::select_target(&targets, Some("b")).unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn select_target_defaults_to_first_page() {
        let targets = vec![
            TargetInfo {
                id: "bg".into(),
                title: "worker".into(),
                url: "".into(),
                target_type: "background_page".into(),
                web_socket_debugger_url: "ws://x/bg".into(),
            },
            TargetInfo {
                id: "p1".into(),
                title: "Tab".into(),
                url: "about:blank".into(),
                target_type: "page".into(),
                web_socket_debugger_url: "ws://x/p1".into(),
            },
        ];
        let picked = ConnectionPool::select_target(&targets, None).unwrap();
        assert_eq!(picked.id, "p1");
    }

    #[test]
    fn select_target_fails_with_no_page() {
        let targets = vec![TargetInfo {
            id: "bg".into(),
            title: "worker".into(),
            url: "".into(),
            target_type: "background_page".into(),
            web_socket_debugger_url: "ws://x/bg".into(),
        }];
        assert!(ConnectionPool::select_target(&targets, None).is_err());
    }

    #[tokio::test]
    async fn dispatch_against_unknown_connection_is_not_found() {
        let pool = ConnectionPool::new(Arc::new(ProxyConfig::default()), Arc::new(MessageStore::new(10, 10)));
        let result = pool
            .dispatch("missing", 1, "Runtime.evaluate", json!({}), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(ProxyError::NotFound(_))));
    }
}
