// SPDX-License-Identifier: MIT
//! Synchronous-looking request/response over the asynchronous CDP stream,
//! with a single-writer lease per connection for the HTTP execute path (§4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection_pool::{ConnectionPool, COMMAND_ID_MAX};
use crate::error::{ProxyError, ProxyResult};
use crate::observability::LatencyTracker;

/// Who currently owns the HTTP execute path for a connection, and since when.
/// §9 open question (b): no explicit release on client crash, so the lease
/// expires on its own after `idle_timeout` of inactivity.
struct Lease {
    client_id: String,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct ExecutorMetricsInner {
    total: u64,
    successful: u64,
    failed: u64,
    timeouts: u64,
    sum_execution_ms: u64,
}

/// Point-in-time snapshot of [`CommandExecutor`] metrics, for `/api/status`
/// and `/metrics`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub average_execution_ms: f64,
}

/// Correlates outbound CDP commands with their responses by ID and enforces
/// the single-writer rule for HTTP clients.
pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    next_id: AtomicI64,
    leases: Mutex<HashMap<String, Lease>>,
    lease_idle: Duration,
    metrics: Mutex<ExecutorMetricsInner>,
    requests_in_flight: AtomicU64,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, lease_idle: Duration) -> Self {
        Self {
            pool,
            next_id: AtomicI64::new(1),
            leases: Mutex::new(HashMap::new()),
            lease_idle,
            metrics: Mutex::new(ExecutorMetricsInner::default()),
            requests_in_flight: AtomicU64::new(0),
        }
    }

    /// Ids wrap within the executor's reserved range, disjoint from the
    /// health-monitor's high-entropy range and the in-actor domain-enable range.
    fn next_message_id(&self) -> i64 {
        self.next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(if v >= COMMAND_ID_MAX { 1 } else { v + 1 })
            })
            .unwrap_or(1)
    }

    /// Acquire (or confirm) ownership of the HTTP execute path for
    /// `connection_id`. A stale lease (idle past `lease_idle`) is silently
    /// reassigned to the new caller.
    async fn acquire(&self, connection_id: &str, client_id: &str) -> ProxyResult<()> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(connection_id) {
            Some(lease) if lease.client_id == client_id => {
                lease.last_used = Instant::now();
                Ok(())
            }
            Some(lease) if lease.last_used.elapsed() > self.lease_idle => {
                debug!(connection_id, stale_owner = %lease.client_id, "execute lease expired, reassigning");
                *lease = Lease {
                    client_id: client_id.to_string(),
                    last_used: Instant::now(),
                };
                Ok(())
            }
            Some(lease) => Err(ProxyError::Conflict(format!(
                "Another CLI client ({}) is driving this connection",
                lease.client_id
            ))),
            None => {
                leases.insert(
                    connection_id.to_string(),
                    Lease {
                        client_id: client_id.to_string(),
                        last_used: Instant::now(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Release the lease on explicit disconnect (§4.4).
    pub async fn release(&self, connection_id: &str) {
        self.leases.lock().await.remove(connection_id);
    }

    /// `execute(ConnectionID, cdpMethod, params, timeoutMs, clientID)` (§4.4).
    pub async fn execute(
        &self,
        connection_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
        client_id: &str,
    ) -> ProxyResult<(Value, u64)> {
        if !self.pool.is_healthy(connection_id).await? {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "connection {connection_id} is not healthy"
            )));
        }
        self.acquire(connection_id, client_id).await?;

        let tracker = LatencyTracker::start(method.to_string());
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        let id = self.next_message_id();
        let result = self
            .pool
            .dispatch(connection_id, id, method, params, timeout)
            .await;
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        let elapsed_ms = tracker.finish_and_elapsed_ms();

        let mut metrics = self.metrics.lock().await;
        metrics.total += 1;
        metrics.sum_execution_ms += elapsed_ms;
        match &result {
            Ok(_) => metrics.successful += 1,
            Err(ProxyError::Timeout(_)) => {
                metrics.failed += 1;
                metrics.timeouts += 1;
            }
            Err(_) => metrics.failed += 1,
        }
        drop(metrics);

        result.map(|value| (value, elapsed_ms))
    }

    pub async fn metrics(&self) -> ExecutorMetrics {
        let m = self.metrics.lock().await;
        ExecutorMetrics {
            total: m.total,
            successful: m.successful,
            failed: m.failed,
            timeouts: m.timeouts,
            average_execution_ms: if m.total == 0 {
                0.0
            } else {
                m.sum_execution_ms as f64 / m.total as f64
            },
        }
    }

    pub fn requests_in_flight(&self) -> u64 {
        self.requests_in_flight.load(Ordering::Relaxed)
    }
}
