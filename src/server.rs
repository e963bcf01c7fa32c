// SPDX-License-Identifier: MIT
//! Composition root (§4.8): wires every component together, starts the
//! background health/maintenance loops, and drives graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::command_executor::CommandExecutor;
use crate::config::ProxyConfig;
use crate::connection_pool::ConnectionPool;
use crate::health_monitor::HealthMonitor;
use crate::message_store::MessageStore;
use crate::middleware::{self, RateLimiter};
use crate::model::now_ms;

/// Shared state handed to every axum handler, cheap to clone (everything
/// inside is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub pool: Arc<ConnectionPool>,
    pub store: Arc<MessageStore>,
    pub executor: Arc<CommandExecutor>,
    pub health_monitor: Arc<HealthMonitor>,
    pub started_at: Instant,
    pub started_at_ms: i64,
    last_activity_ms: Arc<AtomicI64>,
}

impl AppState {
    /// Record that a request was just served, resetting the idle clock that
    /// drives auto-shutdown.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let idle_ms = (now_ms() - last).max(0) as u64;
        Duration::from_millis(idle_ms)
    }
}

/// Owns the running server's lifetime: the bound listener, background task
/// handles, and the shutdown signal that stops all of them together.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MessageStore::new(config.max_console_messages, config.max_network_requests));
        let pool = Arc::new(ConnectionPool::new(config.clone(), store.clone()));
        let executor = Arc::new(CommandExecutor::new(pool.clone(), config.command_timeout()));
        let health_monitor = Arc::new(HealthMonitor::new(pool.clone(), config.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        let state = AppState {
            config: config.clone(),
            pool,
            store,
            executor,
            health_monitor,
            started_at: Instant::now(),
            started_at_ms: now_ms(),
            last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
        };

        Self {
            config,
            state,
            shutdown_tx,
        }
    }

    fn router(&self) -> Router {
        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.rate_limit_per_minute,
            self.config.sensitive_rate_limit_per_minute,
        ));

        Router::new()
            .route("/api/connect", post(crate::api::connect))
            .route("/api/connection/{id}", delete(crate::api::disconnect))
            .route("/api/connections", get(crate::api::connections))
            .route("/api/execute/{id}", post(crate::api::execute))
            .route("/api/console/{id}", get(crate::api::console))
            .route("/api/network/{id}", get(crate::api::network))
            .route("/api/health", get(crate::api::health))
            .route("/api/health/{id}", get(crate::api::health_detail))
            .route("/api/status", get(crate::api::status))
            .route("/metrics", get(crate::api::metrics))
            .route("/ws/{id}", get(crate::api::ws_handler))
            .layer(axum::middleware::from_fn(middleware::security_headers))
            .layer(axum::middleware::from_fn(middleware::request_logging))
            .layer(axum::middleware::from_fn(middleware::enforce_allowlist))
            .layer(axum::middleware::from_fn_with_state(rate_limiter, middleware::rate_limit))
            .layer(axum::middleware::from_fn_with_state(self.config.clone(), middleware::enforce_body_limit))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until a shutdown signal (SIGTERM/Ctrl-C, or the
    /// auto-shutdown idle timer) fires. Spawns the health-check loop and the
    /// periodic maintenance sweep alongside the HTTP listener.
    pub async fn run(self) -> Result<()> {
        self.run_with_ready_signal(None).await
    }

    /// Like [`Self::run`], but reports the bound local address on `ready`
    /// right after binding. Used by integration tests that bind to port 0
    /// and need to learn the OS-assigned port before connecting.
    pub async fn run_with_ready_signal(self, ready: Option<tokio::sync::oneshot::Sender<SocketAddr>>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_host, self.config.port)
            .parse()
            .or_else(|_| format!("127.0.0.1:{}", self.config.port).parse())
            .context("binding address")?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let bound_addr = listener.local_addr().context("reading bound address")?;
        info!(addr = %bound_addr, "cdpd listening");
        if let Some(tx) = ready {
            let _ = tx.send(bound_addr);
        }

        let router = self.router().into_make_service_with_connect_info::<SocketAddr>();

        let health_task = tokio::spawn(health_loop(self.state.health_monitor.clone(), self.config.clone(), self.shutdown_tx.subscribe()));
        let maintenance_task = tokio::spawn(maintenance_loop(
            self.state.store.clone(),
            self.state.pool.clone(),
            self.config.clone(),
            self.shutdown_tx.subscribe(),
        ));
        let idle_task = tokio::spawn(idle_shutdown_loop(
            self.state.clone(),
            self.config.clone(),
            self.shutdown_tx.clone(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_signal = async move {
            tokio::select! {
                _ = external_shutdown_signal() => {}
                _ = shutdown_rx.changed() => {}
            }
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .context("serving http")?;

        let _ = self.shutdown_tx.send(true);
        health_task.abort();
        maintenance_task.abort();
        idle_task.abort();

        info!("closing upstream connections");
        self.state.pool.shutdown_all().await;
        info!("cdpd shut down");
        Ok(())
    }
}

async fn health_loop(monitor: Arc<HealthMonitor>, config: Arc<ProxyConfig>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(config.health_check_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => monitor.run_once().await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn maintenance_loop(
    store: Arc<MessageStore>,
    pool: Arc<ConnectionPool>,
    config: Arc<ProxyConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.maintenance_sweep_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                store.enforce_global_limits().await;
                pool.cleanup_unused(config.auto_shutdown_timeout()).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn idle_shutdown_loop(state: AppState, config: Arc<ProxyConfig>, shutdown_tx: watch::Sender<bool>) {
    // Poll at a fraction of the configured timeout (capped at 100ms) rather
    // than a fixed tick, so short `auto_shutdown_timeout_ms` values (tests,
    // aggressive deployments) are actually honored instead of waiting out a
    // coarse interval that can outlast the timeout itself.
    let poll_interval = (config.auto_shutdown_timeout() / 10).min(Duration::from_millis(100)).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        interval.tick().await;
        if state.idle_for() >= config.auto_shutdown_timeout() {
            info!(idle_timeout_ms = config.auto_shutdown_timeout().as_millis() as u64, "auto-shutdown timer elapsed");
            let _ = shutdown_tx.send(true);
            break;
        }
    }
}

#[cfg(unix)]
async fn external_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn external_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
