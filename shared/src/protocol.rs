//! Wire constants and control frames of the relay protocol

use serde::Serialize;
use serde_json::{json, Value};

/// Version of the relay wire protocol reported by `/info`
pub const PROTOCOL_VERSION: u8 = 1;

/// WebSocket upgrade path served by the hub
pub const WS_PATH: &str = "/ws";

/// Close code: missing or rejected `userId`/`userKey`
pub const CLOSE_INVALID_CREDENTIALS: u16 = 4001;
/// Close code: `mode=reverse` without a `deviceId`
pub const CLOSE_MISSING_DEVICE_ID: u16 = 4002;
/// Close code used by the upstream client when its connect attempt stalls
pub const CLOSE_CONNECT_TIMEOUT: u16 = 4000;
/// Close code sent to every client when the hub shuts down
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub const REASON_INVALID_CREDENTIALS: &str = "Invalid credentials";
pub const REASON_MISSING_DEVICE_ID: &str = "Missing deviceId";
pub const REASON_SERVER_SHUTDOWN: &str = "server shutdown";

/// Connection mode requested by a client in the `mode` query parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Plain subscriber receiving namespace multicast
    Push,
    /// Addressable device registered under `(userId, deviceId)`
    Reverse,
}

impl ClientMode {
    /// Anything other than `reverse` is treated as push.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(mode) if mode.eq_ignore_ascii_case("reverse") => ClientMode::Reverse,
            _ => ClientMode::Push,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Push => "push",
            ClientMode::Reverse => "reverse",
        }
    }
}

/// Frame sent by the hub right after registration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: &'a str,
    pub user_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_label: Option<&'a str>,
}

impl<'a> WelcomeFrame<'a> {
    pub fn new(id: &'a str, user_id: &'a str) -> Self {
        Self {
            kind: "welcome",
            id,
            user_id,
            device_id: None,
            peer_label: None,
        }
    }

    pub fn with_device(mut self, device_id: &'a str, peer_label: &'a str) -> Self {
        self.device_id = Some(device_id);
        self.peer_label = Some(peer_label);
        self
    }
}

/// `{"type":"hello","deviceId":..}` sent by the upstream client after connecting
pub fn hello_frame(device_id: &str) -> Value {
    json!({ "type": "hello", "deviceId": device_id })
}

/// Heartbeat probe; `ts` is milliseconds since the Unix epoch
pub fn ping_frame(ts: u64) -> Value {
    json!({ "type": "ping", "ts": ts })
}

pub fn pong_frame(ts: u64) -> Value {
    json!({ "type": "pong", "ts": ts })
}

/// Milliseconds since the Unix epoch, saturating to zero on clock skew
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
