//! Delivery of upstream frames into the local hub

use std::sync::Arc;

use airpad_relay_shared::protocol::now_millis;
use airpad_relay_shared::{Frame, Route};
use serde_json::{json, Value};
use tracing::debug;

use crate::hub::{Hub, PeerProfile};
use crate::upstream::{MessageHandler, UpstreamConfig};

/// The frame local clients receive for an upstream message
pub fn routed_frame(frame: &Frame, fallback_from: &str) -> Value {
    let mut routed = json!({
        "type": frame.kind,
        "data": frame.payload,
        "from": frame.from.as_deref().unwrap_or(fallback_from),
        "ts": frame.ts.unwrap_or_else(now_millis),
    });
    if let Some(namespace) = &frame.namespace {
        routed["namespace"] = json!(namespace);
    }
    routed
}

/// Match a requested target against connected peers: device id, then exact
/// label, then a label containing (or contained in) the target. Case-insensitive.
pub fn resolve_peer<'a>(profiles: &'a [PeerProfile], target: &str) -> Option<&'a PeerProfile> {
    let target = target.trim().to_lowercase();
    if target.is_empty() {
        return None;
    }
    profiles
        .iter()
        .find(|p| p.id.to_lowercase() == target)
        .or_else(|| profiles.iter().find(|p| p.label.to_lowercase() == target))
        .or_else(|| {
            profiles.iter().find(|p| {
                let label = p.label.to_lowercase();
                !label.is_empty() && (label.contains(&target) || target.contains(&label))
            })
        })
}

/// Route one upstream frame. The frame's `userId` wins over the upstream
/// account's; frames with neither are dropped.
pub fn route_upstream_frame(hub: &Hub, frame: &Frame, cfg: &UpstreamConfig) {
    let user_id = frame
        .user_id
        .as_deref()
        .unwrap_or(cfg.user_id.as_str());
    if user_id.is_empty() {
        return;
    }
    let routed = routed_frame(frame, &cfg.user_id);

    match &frame.route {
        Route::Targeted { id } => {
            let profiles = hub.get_connected_peer_profiles(Some(user_id));
            let device_id = resolve_peer(&profiles, id).map_or(id.as_str(), |p| p.id.as_str());
            if !hub.send_to_device(user_id, device_id, &routed) {
                debug!("Upstream frame for device {} not delivered", id);
            }
        }
        Route::Broadcast => hub.broadcast(user_id, &routed),
        Route::Multicast { namespace } => hub.multicast(user_id, &routed, namespace.as_deref(), None),
    }
}

/// `on_message` callback bound to a hub
pub fn hub_handler(hub: Arc<Hub>) -> MessageHandler {
    Arc::new(move |frame: Frame, _raw: &str, cfg: &UpstreamConfig| {
        route_upstream_frame(&hub, &frame, cfg);
    })
}
