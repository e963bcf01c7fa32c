// SPDX-License-Identifier: MIT
//! Periodic per-upstream health probing; triggers reconnect after consecutive
//! failures (§4.6).
//!
//! Per-upstream consecutive-failure tracking is modeled with the same
//! [`CircuitBreaker`] state machine used for generic external calls: `Closed`
//! means probes are trusted, `Open` means the monitor has given up and handed
//! the connection to reconnect, `HalfOpen` is the post-reconnect probation
//! window.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::ProxyConfig;
use crate::connection_pool::ConnectionPool;
use crate::error::ProxyResult;
use crate::model::{now_ms, ConnectionId};

/// Abstracts the calls [`HealthMonitor`] makes against a connection pool, so
/// tests can substitute a fake without a real upstream.
#[async_trait]
pub trait UpstreamProbe: Send + Sync {
    async fn list_connection_ids(&self) -> Vec<ConnectionId>;
    async fn probe(&self, connection_id: &str) -> ProxyResult<()>;
    async fn reconnect(&self, connection_id: &str) -> ProxyResult<()>;
}

#[async_trait]
impl UpstreamProbe for ConnectionPool {
    async fn list_connection_ids(&self) -> Vec<ConnectionId> {
        self.list().await.into_iter().map(|s| s.connection_id).collect()
    }

    async fn probe(&self, connection_id: &str) -> ProxyResult<()> {
        self.health_check(connection_id).await
    }

    async fn reconnect(&self, connection_id: &str) -> ProxyResult<()> {
        self.force_reconnect(connection_id).await
    }
}

/// Per-upstream health snapshot, published via `GET /api/health/:id`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthDetail {
    pub connection_id: ConnectionId,
    pub is_healthy: bool,
    pub last_check_ms: i64,
    pub consecutive_error_count: u32,
    pub last_error: Option<String>,
    pub state: String,
}

struct HealthRecord {
    breaker: CircuitBreaker,
    is_healthy: bool,
    last_check_ms: i64,
    last_error: Option<String>,
}

/// Periodic prober that triggers [`ConnectionPool::force_reconnect`] after
/// `failure_threshold` consecutive probe failures.
pub struct HealthMonitor {
    probe: Arc<dyn UpstreamProbe>,
    config: Arc<ProxyConfig>,
    records: RwLock<HashMap<ConnectionId, HealthRecord>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn UpstreamProbe>, config: Arc<ProxyConfig>) -> Self {
        Self {
            probe,
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.config.health_check_failure_threshold,
            success_threshold: 1,
            timeout: self.config.health_check_interval(),
        }
    }

    /// Probe every known upstream once. Intended to be called on a
    /// `health_check_interval` tick from [`crate::server::ProxyServer`].
    pub async fn run_once(&self) {
        for connection_id in self.probe.list_connection_ids().await {
            self.check_one(&connection_id).await;
        }
    }

    async fn check_one(&self, connection_id: &str) {
        let outcome = self.probe.probe(connection_id).await;

        let mut records = self.records.write().await;
        let record = records.entry(connection_id.to_string()).or_insert_with(|| HealthRecord {
            breaker: CircuitBreaker::new(format!("upstream:{connection_id}"), self.breaker_config()),
            is_healthy: true,
            last_check_ms: 0,
            last_error: None,
        });
        record.last_check_ms = now_ms();

        match outcome {
            Ok(()) => {
                let was_open = record.breaker.state().await == CircuitState::Open;
                record.breaker.record_success().await;
                record.is_healthy = true;
                record.last_error = None;
                if was_open {
                    debug!(connection_id, "health probe recovered");
                }
            }
            Err(e) => {
                let before = record.breaker.state().await;
                record.breaker.record_failure().await;
                record.is_healthy = false;
                record.last_error = Some(e.to_string());
                let after = record.breaker.state().await;

                if before != CircuitState::Open && after == CircuitState::Open {
                    warn!(connection_id, error = %e, "consecutive health check failures exceeded threshold, reconnecting");
                    let probe = self.probe.clone();
                    let connection_id = connection_id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = probe.reconnect(&connection_id).await {
                            warn!(connection_id = %connection_id, error = %e, "force_reconnect request failed");
                        }
                    });
                }
            }
        }
    }

    pub async fn detail(&self, connection_id: &str) -> Option<HealthDetail> {
        let records = self.records.read().await;
        let record = records.get(connection_id)?;
        Some(HealthDetail {
            connection_id: connection_id.to_string(),
            is_healthy: record.is_healthy,
            last_check_ms: record.last_check_ms,
            consecutive_error_count: record.breaker.failure_count().await,
            last_error: record.last_error.clone(),
            state: record.breaker.state().await.to_string(),
        })
    }

    pub async fn aggregate(&self) -> serde_json::Value {
        let records = self.records.read().await;
        let healthy = records.values().filter(|r| r.is_healthy).count();
        serde_json::json!({
            "total": records.len(),
            "healthy": healthy,
            "unhealthy": records.len() - healthy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct FakeProbe {
        ids: Vec<ConnectionId>,
        fail_until: AtomicU32,
        reconnect_calls: Mutex<u32>,
    }

    #[async_trait]
    impl UpstreamProbe for FakeProbe {
        async fn list_connection_ids(&self) -> Vec<ConnectionId> {
            self.ids.clone()
        }

        async fn probe(&self, _connection_id: &str) -> ProxyResult<()> {
            if self.fail_until.fetch_sub(1, Ordering::Relaxed) > 0 {
                Err(crate::error::ProxyError::UpstreamUnavailable("down".into()))
            } else {
                Ok(())
            }
        }

        async fn reconnect(&self, _connection_id: &str) -> ProxyResult<()> {
            *self.reconnect_calls.lock().await += 1;
            Ok(())
        }
    }

    fn config() -> Arc<ProxyConfig> {
        let mut cfg = ProxyConfig::default();
        cfg.health_check_failure_threshold = 3;
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn reconnect_triggered_after_threshold_failures() {
        let probe = Arc::new(FakeProbe {
            ids: vec!["c1".to_string()],
            fail_until: AtomicU32::new(5),
            reconnect_calls: Mutex::new(0),
        });
        let monitor = HealthMonitor::new(probe.clone(), config());

        for _ in 0..3 {
            monitor.run_once().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let detail = monitor.detail("c1").await.unwrap();
        assert!(!detail.is_healthy);
        assert_eq!(detail.state, "open");
        assert_eq!(*probe.reconnect_calls.lock().await, 1);
    }

    #[tokio::test]
    async fn healthy_probe_keeps_closed_state() {
        let probe = Arc::new(FakeProbe {
            ids: vec!["c1".to_string()],
            fail_until: AtomicU32::new(0),
            reconnect_calls: Mutex::new(0),
        });
        let monitor = HealthMonitor::new(probe, config());
        monitor.run_once().await;
        let detail = monitor.detail("c1").await.unwrap();
        assert!(detail.is_healthy);
        assert_eq!(detail.state, "closed");
    }
}
