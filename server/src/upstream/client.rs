//! Upstream connection driver
//!
//! One task per client owns the socket and the [`Machine`]. The
//! [`UpstreamHandle`] shares only what `send`, `get_status` and `stop`
//! need: the outbound queue of the open session, status fields and a stop
//! signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use airpad_relay_shared::protocol::{
    hello_frame, now_millis, ping_frame, pong_frame, CLOSE_CONNECT_TIMEOUT,
};
use airpad_relay_shared::{decode, encode_envelope, DecodeSource, Frame, Framing};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::config::UpstreamConfig;
use super::endpoints::build_ws_url;
use super::machine::{Machine, Step};
use crate::auth::mask;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::tls::is_tls_verify_error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback for routed upstream frames: normalized frame, raw text, config
pub type MessageHandler = Arc<dyn Fn(Frame, &str, &UpstreamConfig) + Send + Sync>;

const SEND_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Snapshot for health surfaces
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub running: bool,
    pub connected: bool,
    pub upstream_enabled: bool,
    /// WebSocket URL of the latest attempt, secrets masked
    pub endpoint_url: Option<String>,
    pub upstream_endpoints: Vec<String>,
    pub active_endpoint: Option<String>,
    pub user_id: String,
    pub device_id: String,
    pub namespace: String,
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    ws_url: Option<String>,
    active_endpoint: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    last_send_warn: Option<Instant>,
}

struct Shared {
    config: UpstreamConfig,
    candidates: Vec<String>,
    running: AtomicBool,
    link: Mutex<LinkState>,
    stop_tx: watch::Sender<bool>,
}

/// Handle to a running upstream client. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for UpstreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamHandle")
            .field("running", &self.is_running())
            .field("candidates", &self.shared.candidates)
            .finish()
    }
}

impl UpstreamHandle {
    /// Queue a payload for the upstream hub. `false` when no session is open
    /// or the payload cannot be sealed.
    pub fn send(&self, payload: &Value) -> bool {
        let cfg = &self.shared.config;
        let mut link = self.shared.link.lock();
        let Some(tx) = link.outbound.clone() else {
            let now = Instant::now();
            let due = link
                .last_send_warn
                .map_or(true, |at| now.duration_since(at) > SEND_WARN_INTERVAL);
            if due {
                link.last_send_warn = Some(now);
                warn!(
                    "Upstream send blocked: not connected (endpoint={})",
                    link.active_endpoint.as_deref().unwrap_or("-")
                );
            }
            return false;
        };
        drop(link);

        let text = match &cfg.keys {
            Some(keys) => match encode_envelope(&cfg.device_id, payload, keys, Framing::Json) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to seal upstream payload: {}", e);
                    return false;
                }
            },
            None => match payload {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        };
        tx.send(text).is_ok()
    }

    /// True until `stop()`, regardless of connection state
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.link.lock().connected
    }

    pub fn get_status(&self) -> UpstreamStatus {
        let cfg = &self.shared.config;
        let link = self.shared.link.lock();
        UpstreamStatus {
            running: self.is_running(),
            connected: link.connected,
            upstream_enabled: true,
            endpoint_url: link.ws_url.clone(),
            upstream_endpoints: self.shared.candidates.clone(),
            active_endpoint: link.active_endpoint.clone(),
            user_id: cfg.user_id.clone(),
            device_id: cfg.device_id.clone(),
            namespace: cfg.namespace.clone(),
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.shared.config
    }

    /// Idempotent. Closes an open socket with 1000 and ends the driver.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("Stopping upstream client");
            let _ = self.shared.stop_tx.send(true);
        }
    }
}

/// Spawn the driver task for an already-resolved candidate list
pub fn spawn(
    config: UpstreamConfig,
    candidates: Vec<String>,
    connector: Option<Connector>,
    on_message: Option<MessageHandler>,
    diagnostics: Diagnostics,
) -> UpstreamHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let machine = Machine::new(
        candidates.clone(),
        &config.endpoint_url,
        super::machine::ReconnectPolicy {
            reconnect: config.reconnect,
            invalid_credentials_retry: config.invalid_credentials_retry,
            max_missed_heartbeats: config.max_missed_pongs,
        },
    );
    let shared = Arc::new(Shared {
        config,
        candidates,
        running: AtomicBool::new(true),
        link: Mutex::new(LinkState::default()),
        stop_tx,
    });

    let driver = Driver {
        shared: shared.clone(),
        machine,
        connector,
        on_message,
        diagnostics,
        stop_rx,
    };
    tokio::spawn(driver.run());

    UpstreamHandle { shared }
}

/// Hide the user key in a URL before it reaches logs or status
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    let v = if k == "userKey" { mask(&v) } else { v.into_owned() };
                    (k.into_owned(), v)
                })
                .collect();
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
            parsed.to_string()
        }
        Err(_) => "-".to_string(),
    }
}

enum SessionEnd {
    Closed { code: Option<u16>, reason: String },
    Stopped,
}

struct Driver {
    shared: Arc<Shared>,
    machine: Machine,
    connector: Option<Connector>,
    on_message: Option<MessageHandler>,
    diagnostics: Diagnostics,
    stop_rx: watch::Receiver<bool>,
}

impl Driver {
    fn config(&self) -> &UpstreamConfig {
        &self.shared.config
    }

    fn connectivity_log(&self, message: &str) {
        if self.config().tunnel_debug {
            info!("{}", message);
        } else {
            debug!("{}", message);
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn run(mut self) {
        loop {
            if self.stop_requested() {
                self.machine.stop();
            }
            match self.machine.poll(Instant::now()) {
                Step::Stopped => break,
                Step::Wait(delay) => {
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = self.stop_rx.changed() => {}
                    }
                }
                Step::Connect { endpoint } => self.attempt(endpoint).await,
            }
        }
        self.shared.link.lock().outbound = None;
        debug!("Upstream driver finished");
    }

    async fn attempt(&mut self, endpoint: String) {
        let Some(url) = build_ws_url(&endpoint, self.config()) else {
            warn!("Cannot build upstream WebSocket URL for candidate {}", endpoint);
            self.machine.on_unusable_endpoint(Instant::now());
            return;
        };
        {
            let mut link = self.shared.link.lock();
            link.ws_url = Some(redact_url(&url));
            link.active_endpoint = Some(endpoint.clone());
        }
        self.connectivity_log(&format!("Connecting upstream endpoint={}", endpoint));

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            self.connector.clone(),
        );
        let connect_timeout = self.config().connect_timeout;
        let outcome = tokio::select! {
            res = time::timeout(connect_timeout, connect) => Some(res),
            _ = self.stop_rx.changed() => None,
        };

        let end = match outcome {
            None => SessionEnd::Stopped,
            Some(Err(_)) => {
                self.report_connect_failure(&endpoint, "connect-timeout".to_string());
                SessionEnd::Closed {
                    code: Some(CLOSE_CONNECT_TIMEOUT),
                    reason: "connect-timeout".to_string(),
                }
            }
            Some(Ok(Err(e))) => {
                let message = e.to_string();
                if is_tls_verify_error(&message) {
                    warn!(
                        "Upstream TLS verification failed for {}; use AIRPAD_UPSTREAM_REJECT_UNAUTHORIZED=false if the certificate is self-signed",
                        endpoint
                    );
                }
                self.report_connect_failure(&endpoint, message.clone());
                SessionEnd::Closed {
                    code: None,
                    reason: message,
                }
            }
            Some(Ok(Ok((ws, _response)))) => {
                self.machine.on_open();
                self.connectivity_log(&format!("Upstream connected endpoint={}", endpoint));
                self.session(ws).await
            }
        };

        match end {
            SessionEnd::Stopped => self.machine.stop(),
            SessionEnd::Closed { code, reason } => self.on_closed(&endpoint, code, reason),
        }
    }

    fn report_connect_failure(&self, endpoint: &str, error: String) {
        if self.config().tunnel_debug {
            warn!("Upstream connect to {} failed: {}", endpoint, error);
        }
        self.diagnostics.report(DiagnosticEvent::UpstreamConnectFailed {
            endpoint: endpoint.to_string(),
            error,
        });
    }

    fn on_closed(&mut self, endpoint: &str, code: Option<u16>, reason: String) {
        if self.config().tunnel_debug {
            warn!("Upstream closed endpoint={} code={:?} reason={}", endpoint, code, reason);
        }
        self.diagnostics.report(DiagnosticEvent::UpstreamClosed {
            endpoint: endpoint.to_string(),
            code,
            reason: reason.clone(),
        });

        let outcome = self.machine.on_closed(code, &reason, Instant::now());
        if outcome.credentials_rejected {
            let cfg = self.config();
            error!(
                "Invalid upstream credentials for userId=\"{}\" deviceId=\"{}\" endpoint=\"{}\". \
                 Create or align this user on the target endpoint via `/core/auth/register` \
                 (POST {{\"userId\":\"...\",\"userKey\":\"...\"}}) then set the same \
                 upstream.userId/upstream.userKey in both endpoints.",
                cfg.user_id, cfg.device_id, endpoint
            );
            self.diagnostics.report(DiagnosticEvent::UpstreamCredentialsRejected {
                endpoint: endpoint.to_string(),
                retry_ms: outcome.delay.as_millis() as u64,
            });
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let device_id = self.config().device_id.clone();

        // A failed hello still lets the read side report the peer's close frame
        if let Err(e) = sink.send(Message::Text(hello_frame(&device_id).to_string())).await {
            debug!("Upstream hello not sent: {}", e);
        }
        {
            let mut link = self.shared.link.lock();
            link.connected = true;
            link.outbound = Some(tx);
        }

        let heartbeat_every = self.config().heartbeat;
        let mut heartbeat = time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);

        let end = loop {
            tokio::select! {
                _ = self.stop_rx.changed() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client stop".into(),
                        })))
                        .await;
                    break SessionEnd::Stopped;
                }
                Some(text) = rx.recv() => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break SessionEnd::Closed { code: None, reason: e.to_string() };
                    }
                }
                _ = heartbeat.tick() => {
                    if self.machine.on_heartbeat() {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(CLOSE_CONNECT_TIMEOUT),
                                reason: "heartbeat-timeout".into(),
                            })))
                            .await;
                        break SessionEnd::Closed {
                            code: Some(CLOSE_CONNECT_TIMEOUT),
                            reason: "heartbeat-timeout".to_string(),
                        };
                    }
                    if let Err(e) = sink.send(Message::Text(ping_frame(now_millis()).to_string())).await {
                        break SessionEnd::Closed { code: None, reason: e.to_string() };
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.machine.on_inbound();
                        if let Some(reply) = self.handle_text(&text) {
                            let _ = sink.send(Message::Text(reply)).await;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.machine.on_inbound();
                        if let Ok(text) = String::from_utf8(data) {
                            if let Some(reply) = self.handle_text(&text) {
                                let _ = sink.send(Message::Text(reply)).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => self.machine.on_inbound(),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        break SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        if self.config().tunnel_debug {
                            error!("Upstream socket error: {}", e);
                        }
                        break SessionEnd::Closed { code: None, reason: e.to_string() };
                    }
                    None => break SessionEnd::Closed { code: None, reason: String::new() },
                }
            }
        };

        let mut link = self.shared.link.lock();
        link.connected = false;
        link.outbound = None;
        end
    }

    /// Decode and dispatch one frame; returns an immediate reply if any
    fn handle_text(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let cfg = self.config();
        let decoded = decode(text, cfg.keys.as_ref());
        if decoded.source == DecodeSource::Fallback {
            let reason = decoded
                .rejected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.diagnostics.report(DiagnosticEvent::EnvelopeFallback {
                reason: if reason.is_empty() { "no envelope".to_string() } else { reason },
            });
        }

        let value = decoded.value?;
        let source_id = if cfg.device_id.is_empty() { &cfg.user_id } else { &cfg.device_id };
        let frame = Frame::normalize_tunnel(&value, source_id, &cfg.endpoint_url)?;

        if frame.is_type("ping") {
            return Some(pong_frame(now_millis()).to_string());
        }
        if frame.is_control() {
            debug!("Dropping upstream control frame {}", frame.kind);
            return None;
        }
        if let Some(handler) = &self.on_message {
            handler(frame, text, cfg);
        }
        None
    }
}
