//! Shared helpers: a real hub on an ephemeral port and WebSocket clients

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use airpad_relay::db::MemoryUserStore;
use airpad_relay::{routing, Diagnostics, Hub, ServerConfig, ServerState};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
}

impl TestServer {
    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws?{}", self.addr, query)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn spawn_server(users: &[(&str, &str)]) -> TestServer {
    spawn_server_with(users, Diagnostics::new()).await
}

pub async fn spawn_server_with(users: &[(&str, &str)], diagnostics: Diagnostics) -> TestServer {
    let hub = Arc::new(Hub::new(diagnostics.clone()));
    let store = MemoryUserStore::with_users(users.iter().copied());
    let state = ServerState::new(ServerConfig::default(), hub.clone(), Arc::new(store), diagnostics);
    let app = routing::create_router(Arc::new(state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer { addr, hub }
}

pub async fn connect(server: &TestServer, query: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url(query))
        .await
        .expect("WebSocket connect failed");
    ws
}

/// Connect and consume the welcome frame
pub async fn connect_welcomed(server: &TestServer, query: &str) -> (Client, Value) {
    let mut ws = connect(server, query).await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    (ws, welcome)
}

/// Next text frame as JSON, skipping transport pings
pub async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait for the server's close frame and return its code and reason
pub async fn expect_close(ws: &mut Client) -> (u16, String) {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.into_owned())
            }
            Some(Ok(Message::Close(None))) | None => panic!("closed without a close frame"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error before close: {e}"),
        }
    }
}

/// Assert no text frame arrives within a short window
pub async fn assert_silent(ws: &mut Client) {
    let got = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = got {
        panic!("unexpected frame: {text}");
    }
}

pub async fn send_json(ws: &mut Client, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Poll until `check` holds or the wait budget runs out
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
