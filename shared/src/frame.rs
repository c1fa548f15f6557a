//! Frame normalization
//!
//! Inbound frames are loosely typed JSON objects. Every field the relay cares
//! about has several accepted spellings (`type`/`action`, `payload`/`data`/
//! `body`/`message`, `to`/`target`/`targetId`/`target_id`/`deviceId`,
//! `namespace`/`ns`). [`Frame::normalize`] resolves those once at ingress into
//! a [`Route`] so the hub and the upstream router never re-derive routing
//! decisions from raw JSON.

use serde_json::{json, Map, Value};

/// Frame type used when neither `type` nor `action` is present
pub const DEFAULT_FRAME_TYPE: &str = "dispatch";

/// Target values that mean "everyone" rather than a specific peer
const BROADCAST_TARGETS: [&str; 3] = ["broadcast", "all", "*"];

/// Field names probed, in order, for a direct target
const TARGET_FIELDS: [&str; 5] = ["to", "target", "targetId", "target_id", "deviceId"];

/// Field names probed, in order, for the payload
const PAYLOAD_FIELDS: [&str; 4] = ["payload", "data", "body", "message"];

/// Routing decision for a normalized frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Deliver to exactly one peer, addressed by client id or device id
    Targeted { id: String },
    /// Explicit broadcast (`broadcast: true` or a wildcard target)
    Broadcast,
    /// No target given: multicast within a namespace (sender's when `None`)
    Multicast { namespace: Option<String> },
}

/// A frame with its routing fields resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: String,
    pub payload: Value,
    pub from: Option<String>,
    pub namespace: Option<String>,
    pub user_id: Option<String>,
    pub ts: Option<u64>,
    pub via: Option<String>,
    pub route: Route,
}

fn pick_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Frame {
    /// Normalize any JSON value. Non-objects yield `None`; unknown fields are
    /// ignored rather than rejected.
    pub fn normalize(raw: &Value) -> Option<Frame> {
        let obj = raw.as_object()?;

        let kind = pick_string(obj, "type")
            .or_else(|| pick_string(obj, "action"))
            .unwrap_or_else(|| DEFAULT_FRAME_TYPE.to_string());

        let payload = PAYLOAD_FIELDS
            .iter()
            .find_map(|key| obj.get(*key).filter(|v| !v.is_null()).cloned())
            .unwrap_or_else(|| raw.clone());

        let namespace = pick_string(obj, "namespace").or_else(|| pick_string(obj, "ns"));
        let target = TARGET_FIELDS.iter().find_map(|key| pick_string(obj, key));
        let broadcast_flag = obj.get("broadcast").and_then(Value::as_bool) == Some(true);

        let route = match target {
            _ if broadcast_flag => Route::Broadcast,
            Some(t) if BROADCAST_TARGETS.iter().any(|b| t.eq_ignore_ascii_case(b)) => {
                Route::Broadcast
            }
            Some(id) => Route::Targeted { id },
            None => Route::Multicast {
                namespace: namespace.clone(),
            },
        };

        Some(Frame {
            kind,
            payload,
            from: pick_string(obj, "from"),
            namespace,
            user_id: pick_string(obj, "userId"),
            ts: obj.get("ts").and_then(Value::as_u64),
            via: pick_string(obj, "via"),
            route,
        })
    }

    /// Parse text as JSON and normalize; malformed input yields `None`.
    pub fn parse(text: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(text).ok()?;
        Frame::normalize(&value)
    }

    /// Normalize a frame that arrived through an upstream tunnel, stamping
    /// the hop it came through and a fallback sender.
    pub fn normalize_tunnel(raw: &Value, source_id: &str, via: &str) -> Option<Frame> {
        let mut frame = Frame::normalize(raw)?;
        if frame.from.is_none() && !source_id.is_empty() {
            frame.from = Some(source_id.to_string());
        }
        if frame.via.is_none() && !via.is_empty() {
            frame.via = Some(via.to_string());
        }
        Some(frame)
    }

    pub fn is_type(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }

    /// Heartbeat and greeting frames that are never routed
    pub fn is_control(&self) -> bool {
        ["ping", "pong", "hello", "welcome"]
            .iter()
            .any(|kind| self.is_type(kind))
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.route, Route::Broadcast)
    }

    pub fn target(&self) -> Option<&str> {
        match &self.route {
            Route::Targeted { id } => Some(id),
            _ => None,
        }
    }

    /// The `{type, payload, from}` frame a hub forwards to its recipients
    pub fn forwarded(&self, from: &str) -> Value {
        json!({
            "type": self.kind,
            "payload": self.payload,
            "from": from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_aliases() {
        for key in ["to", "target", "targetId", "target_id", "deviceId"] {
            let frame = Frame::normalize(&json!({ key: "dev1", "type": "x" })).unwrap();
            assert_eq!(frame.route, Route::Targeted { id: "dev1".into() }, "alias {key}");
        }
    }

    #[test]
    fn test_target_precedence() {
        let frame = Frame::normalize(&json!({"deviceId": "b", "to": "a"})).unwrap();
        assert_eq!(frame.target(), Some("a"));
    }

    #[test]
    fn test_broadcast_flag_wins_over_target() {
        let frame = Frame::normalize(&json!({"targetId": "dev1", "broadcast": true})).unwrap();
        assert_eq!(frame.route, Route::Broadcast);

        let frame = Frame::normalize(&json!({"target": "ALL"})).unwrap();
        assert!(frame.is_broadcast());
    }

    #[test]
    fn test_no_target_is_multicast() {
        let frame = Frame::normalize(&json!({"type": "note", "ns": "work"})).unwrap();
        assert_eq!(
            frame.route,
            Route::Multicast {
                namespace: Some("work".into())
            }
        );

        let frame = Frame::normalize(&json!({"type": "note"})).unwrap();
        assert_eq!(frame.route, Route::Multicast { namespace: None });
    }

    #[test]
    fn test_type_and_payload_fallbacks() {
        let frame = Frame::normalize(&json!({"action": "copy", "data": {"n": 1}})).unwrap();
        assert_eq!(frame.kind, "copy");
        assert_eq!(frame.payload, json!({"n": 1}));

        let raw = json!({"text": "hi"});
        let frame = Frame::normalize(&raw).unwrap();
        assert_eq!(frame.kind, DEFAULT_FRAME_TYPE);
        assert_eq!(frame.payload, raw);
    }

    #[test]
    fn test_blank_strings_are_ignored() {
        let frame = Frame::normalize(&json!({"type": "  ", "targetId": "", "action": "a"})).unwrap();
        assert_eq!(frame.kind, "a");
        assert_eq!(frame.route, Route::Multicast { namespace: None });
    }

    #[test]
    fn test_non_objects_rejected() {
        assert!(Frame::normalize(&json!([1, 2])).is_none());
        assert!(Frame::normalize(&json!("text")).is_none());
        assert!(Frame::parse("{not json").is_none());
    }

    #[test]
    fn test_tunnel_stamps_origin() {
        let frame = Frame::normalize_tunnel(&json!({"type": "x"}), "node-a", "https://hub").unwrap();
        assert_eq!(frame.from.as_deref(), Some("node-a"));
        assert_eq!(frame.via.as_deref(), Some("https://hub"));

        let frame =
            Frame::normalize_tunnel(&json!({"type": "x", "from": "orig"}), "node-a", "").unwrap();
        assert_eq!(frame.from.as_deref(), Some("orig"));
        assert!(frame.via.is_none());
    }

    #[test]
    fn test_control_frames() {
        assert!(Frame::parse(r#"{"type":"PING"}"#).unwrap().is_control());
        assert!(Frame::parse(r#"{"type":"hello"}"#).unwrap().is_control());
        assert!(Frame::parse(r#"{"type":"welcome","deviceId":"d"}"#).unwrap().is_control());
        assert!(!Frame::parse(r#"{"type":"ping-device"}"#).unwrap().is_control());
    }
}
