//! WebSocket handler for hub clients

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use airpad_relay_shared::protocol::{
    CLOSE_INVALID_CREDENTIALS, CLOSE_MISSING_DEVICE_ID, REASON_INVALID_CREDENTIALS,
    REASON_MISSING_DEVICE_ID,
};
use airpad_relay_shared::ClientMode;

use crate::auth::mask;
use crate::config::ServerConfig;
use crate::db::UserStore;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::hub::{ConnectRequest, Hub, Outbound};
use crate::upstream::UpstreamHandle;

const REJECT_LINGER: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections and HTTP handlers
pub struct ServerState {
    pub config: ServerConfig,
    pub hub: Arc<Hub>,
    pub users: Arc<dyn UserStore>,
    pub diagnostics: Diagnostics,
    /// Present when this node also runs the upstream peer client
    pub upstream: Option<UpstreamHandle>,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        hub: Arc<Hub>,
        users: Arc<dyn UserStore>,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            config,
            hub,
            users,
            diagnostics,
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, upstream: UpstreamHandle) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

// ---------------------------------------------------------------------------
// Handshake parameters
// ---------------------------------------------------------------------------

/// Query string of `/ws`
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "userKey")]
    pub user_key: Option<String>,
    pub ns: Option<String>,
    pub namespace: Option<String>,
    pub mode: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub label: Option<String>,
    pub name: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ConnectParams {
    fn credentials(&self) -> (String, String) {
        (
            non_empty(&self.user_id).unwrap_or_default(),
            non_empty(&self.user_key).unwrap_or_default(),
        )
    }

    fn into_request(self, user_id: String) -> ConnectRequest {
        ConnectRequest {
            user_id,
            namespace: non_empty(&self.ns).or_else(|| non_empty(&self.namespace)),
            reverse: ClientMode::parse(self.mode.as_deref()) == ClientMode::Reverse,
            device_id: non_empty(&self.device_id),
            label: non_empty(&self.label).or_else(|| non_empty(&self.name)),
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade; refused once the hub is closed
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if state.hub.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
        .into_response()
}

async fn reject(mut socket: WebSocket, diagnostics: &Diagnostics, code: u16, reason: &'static str) {
    diagnostics.report(DiagnosticEvent::HandshakeRejected {
        code,
        reason: reason.to_string(),
    });
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;

    // Keep the connection until the client acknowledges so the close frame
    // is not lost to a reset
    let _ = tokio::time::timeout(REJECT_LINGER, async {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    })
    .await;
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, params: ConnectParams) {
    let (user_id, user_key) = params.credentials();

    if state.users.verify_user(&user_id, &user_key).await.is_none() {
        warn!("Rejected connection for user {}: invalid credentials", mask(&user_id));
        reject(socket, &state.diagnostics, CLOSE_INVALID_CREDENTIALS, REASON_INVALID_CREDENTIALS).await;
        return;
    }

    let request = params.into_request(user_id);
    if request.reverse && request.device_id.is_none() {
        warn!("Rejected reverse connection for user {}: no deviceId", mask(&request.user_id));
        reject(socket, &state.diagnostics, CLOSE_MISSING_DEVICE_ID, REASON_MISSING_DEVICE_ID).await;
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client = state.hub.register(request, tx);

    // Forward queued frames in order and send transport pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let client_id = client.id.clone();
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker = tokio::time::interval(Duration::from_secs(ping_interval_secs.max(1)));
        ping_ticker.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Text(text)) => {
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let _ = ws_sender
                                .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick(), if ping_interval_secs > 0 => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Writer for {} finished", client_id);
    });

    // Main receive loop
    while let Some(next) = ws_receiver.next().await {
        match next {
            Ok(Message::Text(text)) => state.hub.handle_text(&client, &text),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => state.hub.handle_text(&client, text),
                Err(_) => state.diagnostics.report(DiagnosticEvent::MalformedFrame {
                    client_id: client.id.clone(),
                }),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => { /* axum answers pings */ }
            Err(e) => {
                debug!("WebSocket error from {}: {}", client.id, e);
                break;
            }
        }
    }

    // Cleanup
    state.hub.unregister(&client.id);
    forward_task.abort();
    info!("Connection {} closed", client.id);
}
