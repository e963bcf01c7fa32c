// SPDX-License-Identifier: MIT
//! A fake Chrome instance for integration tests: serves `GET /json/list` like
//! a real DevTools-enabled browser, and accepts exactly one debugger
//! WebSocket connection per target, replying to every command with an empty
//! result and letting the test script arbitrary CDP events on demand.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;

struct MockState {
    port: u16,
    events: broadcast::Sender<Value>,
}

/// A fake browser debugger endpoint, bound to a random local port.
pub struct MockBrowser {
    pub addr: SocketAddr,
    events: broadcast::Sender<Value>,
}

impl MockBrowser {
    /// Start the mock, exposing a single "page" target named `title`.
    pub async fn start(title: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = broadcast::channel(256);

        let state = Arc::new(MockState {
            port: addr.port(),
            events: events.clone(),
        });
        let title = title.to_string();
        let app = Router::new()
            .route(
                "/json/list",
                get(move |State(s): State<Arc<MockState>>| {
                    let title = title.clone();
                    async move { json_list(s, title).await }
                }),
            )
            .route("/devtools/page/target-1", get(ws_upgrade))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self { addr, events }
    }

    /// Broadcast a CDP event frame to the connected debugger socket, as if
    /// the page had just fired it.
    pub fn emit(&self, method: &str, params: Value) {
        let _ = self.events.send(json!({ "method": method, "params": params }));
    }
}

async fn json_list(state: Arc<MockState>, title: String) -> impl IntoResponse {
    Json(vec![json!({
        "id": "target-1",
        "title": title,
        "url": "http://example.com/",
        "type": "page",
        "webSocketDebuggerUrl": format!("ws://127.0.0.1:{}/devtools/page/target-1", state.port),
    })])
}

async fn ws_upgrade(State(state): State<Arc<MockState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_debugger_socket(socket, state))
}

async fn handle_debugger_socket(socket: WebSocket, state: Arc<MockState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let req: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let id = req.get("id").cloned().unwrap_or(Value::Null);
                        let reply = json!({ "id": id, "result": {} });
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                if let Ok(frame) = event {
                    if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
