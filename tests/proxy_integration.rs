// SPDX-License-Identifier: MIT
//! End-to-end scenarios driving the full HTTP/WS surface against a fake
//! browser debugger (`tests/common`), exercising the literal scenarios this
//! proxy is built around: connection reuse, console/network history and
//! filtering, the single-writer execute conflict, and auto-shutdown.

mod common;

use std::time::Duration;

use cdpd::config::ProxyConfig;
use cdpd::server::ProxyServer;
use common::MockBrowser;
use serde_json::{json, Value};
use tokio::sync::oneshot;

async fn start_proxy(mut config: ProxyConfig) -> std::net::SocketAddr {
    config.bind_host = "127.0.0.1".to_string();
    config.port = 0;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = ProxyServer::new(config).run_with_ready_signal(Some(tx)).await;
    });
    rx.await.expect("proxy failed to start")
}

fn base_url(addr: std::net::SocketAddr) -> String {
    format!("http://{addr}")
}

#[tokio::test]
async fn first_connect_reuses_same_connection_id() {
    let browser = MockBrowser::start("Example Page").await;
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let body = json!({ "host": "127.0.0.1", "port": browser.addr.port() });

    let first: Value = client
        .post(format!("{}/api/connect", base_url(addr)))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(first["success"].as_bool().unwrap());
    let connection_id = first["data"]["connectionId"].as_str().unwrap().to_string();
    assert!(!connection_id.is_empty());
    assert!(first["data"]["isNewConnection"].as_bool().unwrap());

    let second: Value = client
        .post(format!("{}/api/connect", base_url(addr)))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["data"]["connectionId"], connection_id);
    assert!(!second["data"]["isNewConnection"].as_bool().unwrap());
}

#[tokio::test]
async fn console_history_fan_in_and_filtering() {
    let browser = MockBrowser::start("Console Page").await;
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let connect: Value = client
        .post(format!("{}/api/connect", base_url(addr)))
        .json(&json!({ "host": "127.0.0.1", "port": browser.addr.port() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = connect["data"]["connectionId"].as_str().unwrap();

    for (level, text, ts) in [("log", "A", 1000i64), ("warning", "B", 2000), ("error", "C", 3000)] {
        browser.emit(
            "Runtime.consoleAPICalled",
            json!({
                "type": level,
                "args": [{"type": "string", "value": text}],
                "timestamp": ts,
            }),
        );
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let resp: Value = client
        .get(format!("{}/api/console/{}", base_url(addr), id))
        .query(&[("types", "error,warn")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let messages = resp["data"]["messages"].as_array().unwrap();
    assert_eq!(resp["data"]["totalCount"], 2);
    assert_eq!(messages[0]["type"], "warn");
    assert_eq!(messages[0]["text"], "B");
    assert_eq!(messages[1]["type"], "error");
    assert_eq!(messages[1]["text"], "C");
}

#[tokio::test]
async fn network_filtering_and_body_omission() {
    let browser = MockBrowser::start("Network Page").await;
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let connect: Value = client
        .post(format!("{}/api/connect", base_url(addr)))
        .json(&json!({ "host": "127.0.0.1", "port": browser.addr.port() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = connect["data"]["connectionId"].as_str().unwrap();

    browser.emit(
        "Network.requestWillBeSent",
        json!({
            "requestId": "R",
            "request": { "url": "https://api.example.com/v1", "method": "POST", "headers": {} },
            "timestamp": 1.0,
        }),
    );
    browser.emit(
        "Network.responseReceived",
        json!({
            "requestId": "R",
            "response": { "status": 500, "headers": {} },
        }),
    );
    browser.emit("Network.loadingFinished", json!({ "requestId": "R" }));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let resp: Value = client
        .get(format!("{}/api/network/{}", base_url(addr), id))
        .query(&[("methods", "POST"), ("statusCodes", "500"), ("includeResponseBody", "false")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let requests = resp["data"]["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["status"], 500);
    assert!(requests[0].get("responseBody").is_none());
}

#[tokio::test]
async fn concurrent_execute_single_writer_conflict() {
    let browser = MockBrowser::start("Execute Page").await;
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let connect: Value = client
        .post(format!("{}/api/connect", base_url(addr)))
        .json(&json!({ "host": "127.0.0.1", "port": browser.addr.port() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = connect["data"]["connectionId"].as_str().unwrap();

    let first: Value = client
        .post(format!("{}/api/execute/{}", base_url(addr), id))
        .header("x-client-id", "alice")
        .json(&json!({ "command": { "method": "Runtime.evaluate", "params": {} } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(first["success"].as_bool().unwrap());

    let second = client
        .post(format!("{}/api/execute/{}", base_url(addr), id))
        .header("x-client-id", "bob")
        .json(&json!({ "command": { "method": "Runtime.evaluate", "params": {} } }))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = second.json().await.unwrap();
    assert!(!body["success"].as_bool().unwrap());
    assert!(body["error"]["message"].as_str().unwrap().contains("Another CLI client"));
}

#[tokio::test]
async fn unknown_connection_returns_not_found() {
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("{}/api/connection/{}", base_url(addr), "0123456789abcdef0123456789abcdef"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_status_are_reachable() {
    let addr = start_proxy(ProxyConfig::default()).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/api/health", base_url(addr)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["data"]["status"], "healthy");

    let status: Value = client
        .get(format!("{}/api/status", base_url(addr)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(status["data"]["connectionCount"].is_number());

    let metrics = client
        .get(format!("{}/metrics", base_url(addr)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("cdpd_commands_total"));
}

#[tokio::test]
async fn auto_shutdown_closes_the_server_after_idle_timeout() {
    let mut config = ProxyConfig::default();
    config.auto_shutdown_timeout_ms = 300;
    let addr = start_proxy(config).await;
    let client = reqwest::Client::new();

    // Confirm the server is initially up.
    assert!(client.get(format!("{}/api/health", base_url(addr))).send().await.is_ok());

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(client.get(format!("{}/api/health", base_url(addr))).send().await.is_err());
}
