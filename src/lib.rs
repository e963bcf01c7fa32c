// SPDX-License-Identifier: MIT
//! `cdpd`: a persistent multiplexing proxy for the Chrome DevTools Protocol.
//!
//! A long-running daemon holds one canonical CDP WebSocket per
//! `(host, port, targetId)`, archives bounded console/network history,
//! serializes commands from many short-lived HTTP/WS clients onto it, and
//! fans out events with per-client filters.

pub mod api;
pub mod circuit_breaker;
pub mod command_executor;
pub mod config;
pub mod connection_pool;
pub mod error;
pub mod event_monitor;
pub mod health_monitor;
pub mod logging;
pub mod message_store;
pub mod middleware;
pub mod model;
pub mod observability;
pub mod server;
pub mod ws_proxy;

pub use server::{AppState, ProxyServer};
