//! Connection registry and message routing
//!
//! The hub owns three indexes over live sockets:
//! - `clients`: connection id → client entry (info + outbound queue)
//! - `namespaces`: user id → connection ids in registration order
//! - `reverse_clients`: `(user id, device id)` → connection id of the
//!   addressable device; the latest registration wins
//!
//! All state is per instance so several hubs (one per listener) can coexist.
//! Nothing here returns errors to the socket layer: delivery failures are
//! reported through [`Diagnostics`] and surface as `false` where the caller
//! needs to know.

use std::sync::atomic::{AtomicBool, Ordering};

use airpad_relay_shared::protocol::{
    now_millis, pong_frame, WelcomeFrame, CLOSE_GOING_AWAY, REASON_SERVER_SHUTDOWN,
};
use airpad_relay_shared::{ClientMode, Frame, Route};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::diagnostics::{DiagnosticEvent, Diagnostics};

pub type ClientId = String;

/// Queue item for a socket's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;

/// What a client asked for at connect time, after credential checks
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub user_id: String,
    pub namespace: Option<String>,
    pub reverse: bool,
    pub device_id: Option<String>,
    pub label: Option<String>,
}

/// One live socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub user_id: String,
    pub namespace: String,
    pub mode: ClientMode,
    pub device_id: Option<String>,
    pub peer_label: Option<String>,
}

impl ClientInfo {
    pub fn is_reverse(&self) -> bool {
        self.mode == ClientMode::Reverse
    }
}

struct ClientEntry {
    info: ClientInfo,
    tx: OutboundTx,
}

/// Addressable device as listed by `get_connected_peer_profiles`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerProfile {
    pub id: String,
    pub label: String,
}

#[derive(Default)]
pub struct Hub {
    clients: DashMap<ClientId, ClientEntry>,
    namespaces: DashMap<String, Vec<ClientId>>,
    reverse_clients: DashMap<(String, String), ClientId>,
    diagnostics: Diagnostics,
    closed: AtomicBool,
}

impl Hub {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            diagnostics,
            ..Self::default()
        }
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Insert a verified connection and queue its welcome frame.
    ///
    /// Callers must have rejected reverse requests without a device id.
    pub fn register(&self, request: ConnectRequest, tx: OutboundTx) -> ClientInfo {
        let id = uuid::Uuid::new_v4().to_string();
        let namespace = request
            .namespace
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| request.user_id.clone());
        let device_id = request
            .device_id
            .filter(|d| request.reverse && !d.is_empty());
        let mode = if device_id.is_some() {
            ClientMode::Reverse
        } else {
            ClientMode::Push
        };
        let peer_label = device_id
            .as_deref()
            .map(|d| normalize_peer_label(&request.user_id, d, request.label.as_deref()));

        let info = ClientInfo {
            id: id.clone(),
            user_id: request.user_id,
            namespace,
            mode,
            device_id,
            peer_label,
        };

        let welcome = match (&info.device_id, &info.peer_label) {
            (Some(device_id), Some(label)) => {
                WelcomeFrame::new(&info.id, &info.user_id).with_device(device_id, label)
            }
            _ => WelcomeFrame::new(&info.id, &info.user_id),
        };
        if !self.is_closed() {
            if let Ok(text) = serde_json::to_string(&welcome) {
                let _ = tx.send(Outbound::Text(text));
            }
        }

        self.clients.insert(
            id.clone(),
            ClientEntry {
                info: info.clone(),
                tx,
            },
        );
        self.namespaces
            .entry(info.user_id.clone())
            .or_default()
            .push(id.clone());
        if let Some(device_id) = &info.device_id {
            let previous = self
                .reverse_clients
                .insert((info.user_id.clone(), device_id.clone()), id.clone());
            if let Some(previous) = previous {
                debug!("Device {} re-registered, {} is no longer addressable", device_id, previous);
            }
        }

        // A socket verified while close() ran must not outlive the hub
        if self.is_closed() {
            if let Some(entry) = self.clients.get(&id) {
                let _ = entry.tx.send(shutdown_frame());
            }
        }

        info!(
            "Client {} registered (user={}, ns={}, mode={})",
            info.id,
            info.user_id,
            info.namespace,
            info.mode.as_str()
        );
        info
    }

    /// Remove a connection from every index. Safe to call more than once.
    pub fn unregister(&self, id: &str) {
        let Some((_, entry)) = self.clients.remove(id) else {
            return;
        };
        let info = entry.info;

        let now_empty = match self.namespaces.get_mut(&info.user_id) {
            Some(mut ids) => {
                ids.retain(|c| c != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.namespaces.remove_if(&info.user_id, |_, ids| ids.is_empty());
        }

        if let Some(device_id) = &info.device_id {
            // Only drop the device key if a newer connection has not taken it
            self.reverse_clients
                .remove_if(&(info.user_id.clone(), device_id.clone()), |_, owner| owner == id);
        }

        info!("Client {} disconnected (user={})", id, info.user_id);
    }

    pub fn client(&self, id: &str) -> Option<ClientInfo> {
        self.clients.get(id).map(|e| e.info.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of `(user, device)` registrations currently addressable
    pub fn device_count(&self) -> usize {
        self.reverse_clients.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Handle one text frame from a registered client. Never fails.
    pub fn handle_text(&self, sender: &ClientInfo, text: &str) {
        let Some(frame) = Frame::parse(text) else {
            self.diagnostics.report(DiagnosticEvent::MalformedFrame {
                client_id: sender.id.clone(),
            });
            return;
        };

        if sender.is_reverse() {
            // Reverse clients are addressed, not senders; only answer heartbeats
            if frame.is_type("ping") {
                self.deliver(&sender.id, &pong_frame(now_millis()));
            }
            return;
        }

        self.route_from(sender, &frame);
    }

    /// Route a push client's frame: targeted delivery or namespace multicast
    pub fn route_from(&self, sender: &ClientInfo, frame: &Frame) {
        let forwarded = frame.forwarded(&sender.id);
        match &frame.route {
            Route::Targeted { id } => match self.resolve_target(&sender.user_id, id) {
                Some(target) => {
                    self.deliver(&target, &forwarded);
                }
                None => debug!("No client matches target {} from {}", id, sender.id),
            },
            Route::Broadcast | Route::Multicast { .. } => {
                let namespace = frame.namespace.as_deref().unwrap_or(&sender.namespace);
                self.multicast(&sender.user_id, &forwarded, Some(namespace), Some(&sender.id));
            }
        }
    }

    /// Resolve a target id: connection id, then the sender's own device, then
    /// any user's addressable device with that id.
    fn resolve_target(&self, sender_user: &str, target: &str) -> Option<ClientId> {
        if self.clients.contains_key(target) {
            return Some(target.to_string());
        }
        if let Some(owner) = self
            .reverse_clients
            .get(&(sender_user.to_string(), target.to_string()))
        {
            return Some(owner.value().clone());
        }
        self.reverse_clients
            .iter()
            .find(|entry| entry.key().1 == target)
            .map(|entry| entry.value().clone())
    }

    // -----------------------------------------------------------------------
    // Outbound operations
    // -----------------------------------------------------------------------

    fn deliver(&self, id: &str, payload: &Value) -> bool {
        let Some(entry) = self.clients.get(id) else {
            return false;
        };
        let text = payload.to_string();
        if entry.tx.send(Outbound::Text(text)).is_err() {
            drop(entry);
            self.diagnostics.report(DiagnosticEvent::SendFailed {
                client_id: id.to_string(),
            });
            return false;
        }
        true
    }

    fn user_clients(&self, user_id: &str) -> Vec<ClientId> {
        self.namespaces
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Deliver to every client of `user_id` in `namespace` (default: the
    /// user id), skipping `exclude_id`.
    pub fn multicast(
        &self,
        user_id: &str,
        payload: &Value,
        namespace: Option<&str>,
        exclude_id: Option<&str>,
    ) {
        let target_ns = namespace.filter(|ns| !ns.is_empty()).unwrap_or(user_id);
        for id in self.user_clients(user_id) {
            if Some(id.as_str()) == exclude_id {
                continue;
            }
            let in_namespace = self
                .clients
                .get(&id)
                .map(|e| e.info.namespace == target_ns)
                .unwrap_or(false);
            if in_namespace {
                self.deliver(&id, payload);
            }
        }
    }

    /// Deliver to every client of `user_id` regardless of namespace
    pub fn broadcast(&self, user_id: &str, payload: &Value) {
        for id in self.user_clients(user_id) {
            self.deliver(&id, payload);
        }
    }

    pub fn notify(&self, user_id: &str, kind: &str, data: Option<Value>) {
        self.broadcast(user_id, &json!({ "type": kind, "data": data }));
    }

    /// Direct delivery by connection id
    pub fn send_to(&self, client_id: &str, payload: &Value) -> bool {
        self.deliver(client_id, payload)
    }

    /// Direct delivery to an addressable device. Returns `false` when the
    /// device is unknown or its socket is gone; nothing is retried.
    pub fn send_to_device(&self, user_id: &str, device_id: &str, payload: &Value) -> bool {
        let owner = self
            .reverse_clients
            .get(&(user_id.to_string(), device_id.to_string()))
            .map(|e| e.value().clone());
        match owner {
            Some(id) => self.deliver(&id, payload),
            None => false,
        }
    }

    pub fn get_connected_devices(&self, user_id: Option<&str>) -> Vec<String> {
        self.reverse_clients
            .iter()
            .filter(|e| user_id.map_or(true, |u| e.key().0 == u))
            .map(|e| e.key().1.clone())
            .collect()
    }

    pub fn get_connected_peer_profiles(&self, user_id: Option<&str>) -> Vec<PeerProfile> {
        self.reverse_clients
            .iter()
            .filter(|e| user_id.map_or(true, |u| e.key().0 == u))
            .map(|e| {
                let device_id = e.key().1.clone();
                let label = self
                    .clients
                    .get(e.value())
                    .and_then(|c| c.info.peer_label.clone())
                    .unwrap_or_else(|| device_id.clone());
                PeerProfile {
                    id: device_id,
                    label,
                }
            })
            .collect()
    }

    /// Close every socket and refuse further upgrades
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing hub with {} clients", self.clients.len());
        for entry in self.clients.iter() {
            let _ = entry.tx.send(shutdown_frame());
        }
    }
}

fn shutdown_frame() -> Outbound {
    Outbound::Close {
        code: CLOSE_GOING_AWAY,
        reason: REASON_SERVER_SHUTDOWN.to_string(),
    }
}

fn is_ip_like(value: &str) -> bool {
    value.parse::<std::net::IpAddr>().is_ok()
        || (!value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit() || c == ':') && value.contains(':'))
}

fn hash_suffix(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))[..8].to_string()
}

/// Human-friendly label for a reverse peer. Not authoritative.
pub fn normalize_peer_label(user_id: &str, device_id: &str, label: Option<&str>) -> String {
    let user_part: String = {
        let trimmed = user_id.trim();
        let base = if trimmed.is_empty() { "user" } else { trimmed };
        base.chars().take(16).collect()
    };
    let source = label
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| device_id.trim());
    if source.is_empty() {
        return format!("{user_part}-peer");
    }
    let hashed = || format!("{user_part}-peer-{}", hash_suffix(&format!("{user_id}|{source}")));
    if is_ip_like(source) {
        return hashed();
    }

    let mut sanitized = String::with_capacity(source.len());
    for c in source.to_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            c
        } else {
            '-'
        };
        if c == '-' && sanitized.ends_with('-') {
            continue;
        }
        sanitized.push(c);
    }
    let sanitized: String = sanitized.trim_matches('-').chars().take(48).collect();
    if sanitized.is_empty() {
        hashed()
    } else {
        sanitized
    }
}
