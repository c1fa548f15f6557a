//! Hub integration tests
//!
//! These tests verify, over real sockets:
//! - Handshake acceptance and rejection codes
//! - Namespace multicast and targeted delivery
//! - Reverse device registration and displacement
//! - Registry cleanup after close

mod common;

use std::sync::Arc;

use airpad_relay::{DiagnosticEvent, Diagnostics};
use common::*;
use futures::SinkExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

const USERS: [(&str, &str); 2] = [("u1", "k1"), ("u2", "k2")];

#[tokio::test]
async fn test_invalid_credentials_close_4001() {
    let server = spawn_server(&USERS).await;

    let mut ws = connect(&server, "userId=u1&userKey=wrong").await;
    assert_eq!(expect_close(&mut ws).await, (4001, "Invalid credentials".to_string()));

    let mut ws = connect(&server, "userKey=k1").await;
    assert_eq!(expect_close(&mut ws).await.0, 4001);

    assert_eq!(server.hub.client_count(), 0);
}

#[tokio::test]
async fn test_reverse_without_device_close_4002() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let diagnostics = Diagnostics::with_sink(move |e| sink.lock().push(e.clone()));
    let server = spawn_server_with(&USERS, diagnostics).await;

    let mut ws = connect(&server, "userId=u1&userKey=k1&mode=reverse").await;
    assert_eq!(expect_close(&mut ws).await, (4002, "Missing deviceId".to_string()));

    assert_eq!(server.hub.client_count(), 0);
    assert!(server.hub.get_connected_devices(None).is_empty());
    assert!(events.lock().contains(&DiagnosticEvent::HandshakeRejected {
        code: 4002,
        reason: "Missing deviceId".into()
    }));
}

#[tokio::test]
async fn test_namespace_multicast_end_to_end() {
    let server = spawn_server(&USERS).await;

    let (mut a, welcome_a) = connect_welcomed(&server, "userId=u1&userKey=k1&ns=work").await;
    let (mut b, _) = connect_welcomed(&server, "userId=u1&userKey=k1&namespace=work").await;
    let (mut c, _) = connect_welcomed(&server, "userId=u1&userKey=k1&ns=home").await;
    let (mut other_user, _) = connect_welcomed(&server, "userId=u2&userKey=k2&ns=work").await;
    assert_eq!(welcome_a["userId"], "u1");

    send_json(&mut a, &json!({"type": "clip", "data": "hello"})).await;

    assert_eq!(
        next_json(&mut b).await,
        json!({"type": "clip", "payload": "hello", "from": welcome_a["id"]})
    );
    assert_silent(&mut a).await;
    assert_silent(&mut c).await;
    assert_silent(&mut other_user).await;
}

#[tokio::test]
async fn test_targeted_to_reverse_device() {
    let server = spawn_server(&USERS).await;

    let (mut device, welcome) =
        connect_welcomed(&server, "userId=u1&userKey=k1&mode=reverse&deviceId=phone&label=My%20Phone").await;
    assert_eq!(welcome["deviceId"], "phone");
    assert_eq!(welcome["peerLabel"], "my-phone");

    let (mut sender, welcome_sender) = connect_welcomed(&server, "userId=u1&userKey=k1").await;
    send_json(&mut sender, &json!({"action": "sms.send", "targetId": "phone", "body": {"to": "1"}})).await;

    assert_eq!(
        next_json(&mut device).await,
        json!({"type": "sms.send", "payload": {"to": "1"}, "from": welcome_sender["id"]})
    );

    // Once the device is gone the same frame is dropped without side effects
    device.close(None).await.unwrap();
    let hub = server.hub.clone();
    assert!(eventually(|| hub.device_count() == 0).await);
    send_json(&mut sender, &json!({"action": "sms.send", "targetId": "phone", "body": {"to": "1"}})).await;
    assert_silent(&mut sender).await;
    assert_eq!(server.hub.client_count(), 1);
}

#[tokio::test]
async fn test_reverse_client_ping_gets_pong() {
    let server = spawn_server(&USERS).await;
    let (mut device, _) = connect_welcomed(&server, "userId=u1&userKey=k1&mode=reverse&deviceId=d1").await;
    let (mut push, _) = connect_welcomed(&server, "userId=u1&userKey=k1").await;

    send_json(&mut device, &json!({"type": "ping", "ts": 1})).await;
    assert_eq!(next_json(&mut device).await["type"], "pong");

    send_json(&mut device, &json!({"type": "status", "data": 1})).await;
    assert_silent(&mut push).await;
}

#[tokio::test]
async fn test_device_displacement_and_cleanup() {
    let server = spawn_server(&USERS).await;
    let query = "userId=u1&userKey=k1&mode=reverse&deviceId=dev1";

    let (mut first, _) = connect_welcomed(&server, query).await;
    let (mut second, _) = connect_welcomed(&server, query).await;

    assert!(server.hub.send_to_device("u1", "dev1", &json!({"type": "x"})));
    assert_eq!(next_json(&mut second).await["type"], "x");
    assert_silent(&mut first).await;

    // Closing the displaced socket leaves the newer registration intact
    first.close(None).await.unwrap();
    let hub = server.hub.clone();
    assert!(eventually(|| hub.client_count() == 1).await);
    assert!(server.hub.send_to_device("u1", "dev1", &json!({"type": "y"})));
    assert_eq!(next_json(&mut second).await["type"], "y");

    second.close(None).await.unwrap();
    assert!(eventually(|| hub.client_count() == 0).await);
    assert!(!server.hub.send_to_device("u1", "dev1", &json!({"type": "z"})));
    assert!(server.hub.get_connected_devices(Some("u1")).is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_dropped() {
    let malformed = Arc::new(Mutex::new(0usize));
    let counter = malformed.clone();
    let diagnostics = Diagnostics::with_sink(move |e| {
        if matches!(e, DiagnosticEvent::MalformedFrame { .. }) {
            *counter.lock() += 1;
        }
    });
    let server = spawn_server_with(&USERS, diagnostics).await;

    let (mut a, welcome_a) = connect_welcomed(&server, "userId=u1&userKey=k1").await;
    let (mut b, _) = connect_welcomed(&server, "userId=u1&userKey=k1").await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    send_json(&mut a, &json!({"type": "after"})).await;

    // The connection survives and later frames still route
    let got = next_json(&mut b).await;
    assert_eq!(got["type"], "after");
    assert_eq!(got["from"], welcome_a["id"]);
    assert_eq!(*malformed.lock(), 1);
}

#[tokio::test]
async fn test_close_rejects_new_upgrades() {
    let server = spawn_server(&USERS).await;
    let (mut ws, _) = connect_welcomed(&server, "userId=u1&userKey=k1").await;

    server.hub.close();
    assert_eq!(expect_close(&mut ws).await.0, 1001);

    let refused = tokio_tungstenite::connect_async(server.ws_url("userId=u1&userKey=k1")).await;
    assert!(refused.is_err());
}
