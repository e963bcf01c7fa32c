// SPDX-License-Identifier: MIT
//! Bounded per-connection FIFO history for console messages and network
//! requests, with read-side filtering (§4.1).

use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{ConnectionId, ConsoleEntry, ConsoleLevel, ConsoleSource, NetworkEntry, NetworkPatch};

/// Read-side filter for `GET /api/console/:id`.
#[derive(Debug, Default, Clone)]
pub struct ConsoleFilter {
    pub types: Option<HashSet<ConsoleLevel>>,
    pub text_pattern: Option<Regex>,
    pub source: Option<ConsoleSource>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub max: Option<usize>,
}

/// Read-side filter for `GET /api/network/:id`.
#[derive(Debug, Default, Clone)]
pub struct NetworkFilter {
    pub methods: Option<HashSet<String>>,
    pub status_codes: Option<HashSet<u16>>,
    pub url_pattern: Option<Regex>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub max: Option<usize>,
    pub include_response_body: bool,
}

impl Default for ConsoleLevel {
    fn default() -> Self {
        ConsoleLevel::Log
    }
}

// `ConsoleLevel` must be hashable to live in a `HashSet` filter.
impl std::hash::Hash for ConsoleLevel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

#[derive(Default)]
struct ConnectionBuffers {
    console: VecDeque<ConsoleEntry>,
    network: VecDeque<NetworkEntry>,
}

/// Bounded per-connection ring buffers for console and network history.
pub struct MessageStore {
    buffers: RwLock<HashMap<ConnectionId, ConnectionBuffers>>,
    max_console: usize,
    max_network: usize,
}

impl MessageStore {
    pub fn new(max_console: usize, max_network: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_console,
            max_network,
        }
    }

    /// `append(ConnectionID, entry)` for console messages — O(1) amortized,
    /// evicting the oldest entry once the cap is exceeded.
    pub async fn append_console(&self, entry: ConsoleEntry) {
        let mut guard = self.buffers.write().await;
        let buf = guard.entry(entry.connection_id.clone()).or_default();
        buf.console.push_back(entry);
        while buf.console.len() > self.max_console {
            buf.console.pop_front();
        }
    }

    /// `append(ConnectionID, entry)` for a newly observed network request.
    pub async fn append_network(&self, entry: NetworkEntry) {
        let mut guard = self.buffers.write().await;
        let buf = guard.entry(entry.connection_id.clone()).or_default();
        buf.network.push_back(entry);
        while buf.network.len() > self.max_network {
            buf.network.pop_front();
        }
    }

    /// `updateNetwork(ConnectionID, requestID, patch)` — no-op if the
    /// `requestID` is not present (e.g. it was already evicted).
    pub async fn update_network(&self, connection_id: &str, request_id: &str, patch: NetworkPatch) {
        let mut guard = self.buffers.write().await;
        let Some(buf) = guard.get_mut(connection_id) else {
            return;
        };
        let Some(entry) = buf.network.iter_mut().find(|e| e.request_id == request_id) else {
            return;
        };
        if let Some(status) = patch.status {
            entry.status = Some(status);
        }
        if let Some(headers) = patch.response_headers {
            entry.response_headers = Some(headers);
        }
        if let Some(body) = patch.response_body {
            entry.response_body = Some(body);
        }
        if let Some(finished) = patch.loading_finished {
            entry.loading_finished = finished;
        }
    }

    /// `query(ConnectionID, filter)` over console history. A pure read: takes
    /// a snapshot under the lock and filters/clones it before returning.
    pub async fn query_console(&self, connection_id: &str, filter: &ConsoleFilter) -> Vec<ConsoleEntry> {
        let guard = self.buffers.read().await;
        let Some(buf) = guard.get(connection_id) else {
            return Vec::new();
        };
        let mut out: Vec<ConsoleEntry> = buf
            .console
            .iter()
            .filter(|e| filter.types.as_ref().map_or(true, |t| t.contains(&e.level)))
            .filter(|e| filter.source.map_or(true, |s| s == e.source))
            .filter(|e| filter.start_time.map_or(true, |t| e.timestamp >= t))
            .filter(|e| filter.end_time.map_or(true, |t| e.timestamp <= t))
            .filter(|e| {
                filter
                    .text_pattern
                    .as_ref()
                    .map_or(true, |re| re.is_match(&e.text))
            })
            .cloned()
            .collect();
        if let Some(max) = filter.max {
            if out.len() > max {
                out = out.split_off(out.len() - max);
            }
        }
        out
    }

    /// `query(ConnectionID, filter)` over network history, redacting
    /// `responseBody` unless `includeResponseBody` is set.
    pub async fn query_network(&self, connection_id: &str, filter: &NetworkFilter) -> Vec<NetworkEntry> {
        let guard = self.buffers.read().await;
        let Some(buf) = guard.get(connection_id) else {
            return Vec::new();
        };
        let mut out: Vec<NetworkEntry> = buf
            .network
            .iter()
            .filter(|e| {
                filter
                    .methods
                    .as_ref()
                    .map_or(true, |m| m.contains(&e.method.to_uppercase()))
            })
            .filter(|e| {
                filter
                    .status_codes
                    .as_ref()
                    .map_or(true, |codes| e.status.is_some_and(|s| codes.contains(&s)))
            })
            .filter(|e| filter.start_time.map_or(true, |t| e.timestamp >= t))
            .filter(|e| filter.end_time.map_or(true, |t| e.timestamp <= t))
            .filter(|e| {
                filter
                    .url_pattern
                    .as_ref()
                    .map_or(true, |re| re.is_match(&e.url))
            })
            .cloned()
            .collect();
        if !filter.include_response_body {
            for e in &mut out {
                e.response_body = None;
            }
        }
        if let Some(max) = filter.max {
            if out.len() > max {
                out = out.split_off(out.len() - max);
            }
        }
        out
    }

    /// `cleanup(ConnectionID)` — drops both buffers for a closed connection.
    pub async fn cleanup(&self, connection_id: &str) {
        self.buffers.write().await.remove(connection_id);
    }

    /// Aggregate buffer sizes across all connections, for `/api/status` and
    /// `/api/connections`.
    pub async fn totals(&self) -> (usize, usize) {
        let guard = self.buffers.read().await;
        guard.values().fold((0, 0), |(c, n), b| {
            (c + b.console.len(), n + b.network.len())
        })
    }

    /// `enforceGlobalLimits()` — if the aggregate console or network buffer
    /// size exceeds 2x the per-connection cap, drop the oldest 20% of the
    /// largest offending connection's buffer. Runs once per maintenance sweep.
    pub async fn enforce_global_limits(&self) {
        let mut guard = self.buffers.write().await;
        let console_total: usize = guard.values().map(|b| b.console.len()).sum();
        let network_total: usize = guard.values().map(|b| b.network.len()).sum();

        if console_total > 2 * self.max_console {
            if let Some((id, len)) = guard
                .iter()
                .map(|(id, b)| (id.clone(), b.console.len()))
                .max_by_key(|(_, len)| *len)
            {
                let drop_n = (len as f64 * 0.2).ceil() as usize;
                if let Some(buf) = guard.get_mut(&id) {
                    for _ in 0..drop_n.min(buf.console.len()) {
                        buf.console.pop_front();
                    }
                }
                debug!(connection_id = %id, drop_n, "enforceGlobalLimits: trimmed console buffer");
            }
        }

        if network_total > 2 * self.max_network {
            if let Some((id, len)) = guard
                .iter()
                .map(|(id, b)| (id.clone(), b.network.len()))
                .max_by_key(|(_, len)| *len)
            {
                let drop_n = (len as f64 * 0.2).ceil() as usize;
                if let Some(buf) = guard.get_mut(&id) {
                    for _ in 0..drop_n.min(buf.network.len()) {
                        buf.network.pop_front();
                    }
                }
                debug!(connection_id = %id, drop_n, "enforceGlobalLimits: trimmed network buffer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn console(id: &str, level: ConsoleLevel, text: &str, ts: i64) -> ConsoleEntry {
        ConsoleEntry {
            connection_id: id.to_string(),
            level,
            text: text.to_string(),
            args: vec![],
            timestamp: ts,
            stack: None,
            source: ConsoleSource::ConsoleApi,
        }
    }

    fn network(id: &str, method: &str, url: &str, ts: i64) -> NetworkEntry {
        NetworkEntry {
            connection_id: id.to_string(),
            request_id: format!("r{ts}"),
            url: url.to_string(),
            method: method.to_string(),
            request_headers: Default::default(),
            timestamp: ts,
            status: None,
            response_headers: None,
            response_body: None,
            loading_finished: false,
        }
    }

    #[tokio::test]
    async fn eviction_preserves_order_and_cap() {
        let store = MessageStore::new(2, 2);
        for i in 0..5 {
            store
                .append_console(console("c1", ConsoleLevel::Log, &i.to_string(), i))
                .await;
        }
        let all = store.query_console("c1", &ConsoleFilter::default()).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "3");
        assert_eq!(all[1].text, "4");
    }

    #[tokio::test]
    async fn console_history_fan_in_scenario() {
        let store = MessageStore::new(1000, 500);
        store.append_console(console("c1", ConsoleLevel::Log, "A", 1000)).await;
        store.append_console(console("c1", ConsoleLevel::Warn, "B", 2000)).await;
        store.append_console(console("c1", ConsoleLevel::Error, "C", 3000)).await;

        let mut types = HashSet::new();
        types.insert(ConsoleLevel::Error);
        types.insert(ConsoleLevel::Warn);
        let filter = ConsoleFilter {
            types: Some(types),
            ..Default::default()
        };
        let result = store.query_console("c1", &filter).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].text, "B");
        assert_eq!(result[1].text, "C");
    }

    #[tokio::test]
    async fn network_filter_redacts_body_by_default() {
        let store = MessageStore::new(1000, 500);
        let mut entry = network("c1", "POST", "https://api.example.com/v1", 1);
        entry.request_id = "R".to_string();
        store.append_network(entry).await;
        store
            .update_network(
                "c1",
                "R",
                NetworkPatch {
                    status: Some(500),
                    response_body: Some("body".to_string()),
                    loading_finished: Some(true),
                    ..Default::default()
                },
            )
            .await;

        let mut methods = HashSet::new();
        methods.insert("POST".to_string());
        let mut codes = HashSet::new();
        codes.insert(500);
        let filter = NetworkFilter {
            methods: Some(methods),
            status_codes: Some(codes),
            include_response_body: false,
            ..Default::default()
        };
        let result = store.query_network("c1", &filter).await;
        assert_eq!(result.len(), 1);
        assert!(result[0].response_body.is_none());
        assert_eq!(result[0].status, Some(500));
    }

    #[tokio::test]
    async fn update_network_is_noop_for_unknown_request_id() {
        let store = MessageStore::new(1000, 500);
        store
            .update_network("missing", "whatever", NetworkPatch::default())
            .await;
        // no panic, nothing to assert beyond not crashing
    }

    #[tokio::test]
    async fn enforce_global_limits_trims_largest_offender() {
        // A single connection is capped at `max_console` by `append_console`'s
        // own eviction, so the aggregate only crosses `2 * max_console` once
        // more than two connections are in play. Use three, with "big" the
        // sole connection pinned at the per-connection cap so it's the
        // unambiguous largest offender.
        let store = MessageStore::new(10, 10);
        for i in 0..10 {
            store
                .append_console(console("big", ConsoleLevel::Log, &i.to_string(), i))
                .await;
        }
        for i in 0..5 {
            store
                .append_console(console("mid1", ConsoleLevel::Log, &i.to_string(), i))
                .await;
        }
        for i in 0..5 {
            store
                .append_console(console("mid2", ConsoleLevel::Log, &i.to_string(), i))
                .await;
        }
        for i in 0..2 {
            store
                .append_console(console("mid3", ConsoleLevel::Log, &i.to_string(), i))
                .await;
        }

        let (console_total_before, _) = store.totals().await;
        assert_eq!(console_total_before, 22);

        store.enforce_global_limits().await;

        let big = store.query_console("big", &ConsoleFilter::default()).await;
        let mid1 = store.query_console("mid1", &ConsoleFilter::default()).await;
        // "big" had 10 entries; ceil(10 * 0.2) == 2 dropped, leaving 8.
        assert_eq!(big.len(), 8);
        assert_eq!(mid1.len(), 5);
        let (console_total_after, _) = store.totals().await;
        assert_eq!(console_total_after, 20);
    }

    #[tokio::test]
    async fn cleanup_drops_both_buffers() {
        let store = MessageStore::new(10, 10);
        store.append_console(console("c1", ConsoleLevel::Log, "x", 1)).await;
        store.append_network(network("c1", "GET", "https://x", 1)).await;
        store.cleanup("c1").await;
        assert!(store.query_console("c1", &ConsoleFilter::default()).await.is_empty());
        assert!(store.query_network("c1", &NetworkFilter::default()).await.is_empty());
    }
}
