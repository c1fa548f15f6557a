//! HTTP operations over the hub
//!
//! Every body carries `userId`/`userKey`. Credential failures and missing
//! fields are answered with `{ok:false, error}` and HTTP 200.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use airpad_relay_shared::frame::DEFAULT_FRAME_TYPE;

use crate::auth::mask;
use crate::db::UserRecord;
use crate::websocket::ServerState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_key: String,
    pub namespace: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub action: Option<String>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl OpsRequest {
    fn frame_type(&self) -> String {
        [&self.kind, &self.action]
            .into_iter()
            .flatten()
            .map(|t| t.trim())
            .find(|t| !t.is_empty())
            .unwrap_or(DEFAULT_FRAME_TYPE)
            .to_string()
    }

    fn data(&self) -> Option<Value> {
        (!self.data.is_null()).then(|| self.data.clone())
    }
}

fn failure(error: &str) -> Json<Value> {
    Json(json!({ "ok": false, "error": error }))
}

async fn authorize(state: &ServerState, req: &OpsRequest) -> Result<UserRecord, Json<Value>> {
    match state.users.verify_user(req.user_id.trim(), &req.user_key).await {
        Some(record) => Ok(record),
        None => {
            warn!("Ops request rejected for user {}", mask(&req.user_id));
            Err(failure("Invalid credentials"))
        }
    }
}

/// `POST /core/ops/ws/send`: multicast into a namespace
pub async fn ws_send(State(state): State<Arc<ServerState>>, Json(req): Json<OpsRequest>) -> Json<Value> {
    let user = match authorize(&state, &req).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    let payload = json!({ "type": req.frame_type(), "data": req.data });
    state
        .hub
        .multicast(&user.user_id, &payload, req.namespace.as_deref(), None);
    Json(json!({ "ok": true }))
}

/// `POST /core/reverse/send`: deliver to one reverse device
pub async fn reverse_send(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<OpsRequest>,
) -> Json<Value> {
    let user = match authorize(&state, &req).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    let Some(device_id) = req
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    else {
        return failure("Missing deviceId");
    };

    let payload = json!({ "type": req.frame_type(), "data": req.data });
    let delivered = state.hub.send_to_device(&user.user_id, device_id, &payload);
    Json(json!({
        "ok": delivered,
        "delivered": if delivered { "ws-reverse" } else { "ws-reverse-missing" },
        "deviceId": device_id,
    }))
}

/// `POST /core/reverse/devices`: devices currently addressable for the user
pub async fn reverse_devices(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<OpsRequest>,
) -> Json<Value> {
    let user = match authorize(&state, &req).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    Json(json!({
        "ok": true,
        "reverseDevices": state.hub.get_connected_devices(Some(&user.user_id)),
        "reverseDeviceProfiles": state.hub.get_connected_peer_profiles(Some(&user.user_id)),
    }))
}

/// `POST /core/ops/notify`
pub async fn notify(State(state): State<Arc<ServerState>>, Json(req): Json<OpsRequest>) -> Json<Value> {
    let user = match authorize(&state, &req).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    state.hub.notify(&user.user_id, &req.frame_type(), req.data());
    Json(json!({ "ok": true }))
}

/// `POST /core/ops/broadcast`: every namespace of the user
pub async fn broadcast(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<OpsRequest>,
) -> Json<Value> {
    let user = match authorize(&state, &req).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    let payload = json!({ "type": req.frame_type(), "data": req.data });
    state.hub.broadcast(&user.user_id, &payload);
    Json(json!({ "ok": true }))
}

/// `POST /core/auth/register`
pub async fn register(State(state): State<Arc<ServerState>>, Json(req): Json<OpsRequest>) -> Json<Value> {
    match state.users.register_user(req.user_id.trim(), &req.user_key).await {
        Ok(user) => {
            info!("Registered user {} via ops", mask(&user.user_id));
            Json(json!({ "ok": true, "user": user }))
        }
        Err(e) => failure(&e.to_string()),
    }
}

/// `GET /core/network/status`
pub async fn network_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let upstream = match &state.upstream {
        Some(handle) => serde_json::to_value(handle.get_status()).unwrap_or(Value::Null),
        None => json!({ "upstreamEnabled": false }),
    };
    Json(json!({
        "ok": true,
        "upstream": upstream,
        "clients": state.hub.client_count(),
        "reverseDevices": state.hub.device_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_fallbacks() {
        let req: OpsRequest = serde_json::from_value(json!({"userId": "u", "userKey": "k"})).unwrap();
        assert_eq!(req.frame_type(), "dispatch");
        assert!(req.data().is_none());

        let req: OpsRequest =
            serde_json::from_value(json!({"action": "open", "data": {"x": 1}})).unwrap();
        assert_eq!(req.frame_type(), "open");
        assert_eq!(req.data(), Some(json!({"x": 1})));

        let req: OpsRequest = serde_json::from_value(json!({"type": " ", "action": "b"})).unwrap();
        assert_eq!(req.frame_type(), "b");
    }
}
