//! Ops router tests over HTTP

mod common;

use common::*;
use serde_json::{json, Value};

const USERS: [(&str, &str); 1] = [("u1", "k1")];

async fn post(server: &TestServer, path: &str, body: Value) -> Value {
    reqwest::Client::new()
        .post(server.http_url(path))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_and_info() {
    let server = spawn_server(&USERS).await;
    let health = reqwest::get(server.http_url("/health")).await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let info: Value = reqwest::get(server.http_url("/info")).await.unwrap().json().await.unwrap();
    assert_eq!(info["protocol_version"], 1);
}

#[tokio::test]
async fn test_rejects_bad_credentials() {
    let server = spawn_server(&USERS).await;
    let reply = post(&server, "/core/ops/notify", json!({"userId": "u1", "userKey": "nope", "type": "x"})).await;
    assert_eq!(reply, json!({"ok": false, "error": "Invalid credentials"}));
}

#[tokio::test]
async fn test_reverse_send_and_devices() {
    let server = spawn_server(&USERS).await;
    let (mut device, _) =
        connect_welcomed(&server, "userId=u1&userKey=k1&mode=reverse&deviceId=tab&name=Kitchen").await;

    let devices = post(&server, "/api/reverse/devices", json!({"userId": "u1", "userKey": "k1"})).await;
    assert_eq!(devices["reverseDevices"], json!(["tab"]));
    assert_eq!(devices["reverseDeviceProfiles"], json!([{"id": "tab", "label": "kitchen"}]));

    let reply = post(
        &server,
        "/core/reverse/send",
        json!({"userId": "u1", "userKey": "k1", "deviceId": "tab", "action": "open", "data": {"url": "x"}}),
    )
    .await;
    assert_eq!(reply, json!({"ok": true, "delivered": "ws-reverse", "deviceId": "tab"}));
    assert_eq!(next_json(&mut device).await, json!({"type": "open", "data": {"url": "x"}}));

    let missing = post(
        &server,
        "/core/reverse/send",
        json!({"userId": "u1", "userKey": "k1", "deviceId": "gone"}),
    )
    .await;
    assert_eq!(missing, json!({"ok": false, "delivered": "ws-reverse-missing", "deviceId": "gone"}));

    let no_device = post(&server, "/core/reverse/send", json!({"userId": "u1", "userKey": "k1"})).await;
    assert_eq!(no_device["error"], "Missing deviceId");
}

#[tokio::test]
async fn test_ws_send_notify_broadcast() {
    let server = spawn_server(&USERS).await;
    let (mut work, _) = connect_welcomed(&server, "userId=u1&userKey=k1&ns=work").await;
    let (mut default_ns, _) = connect_welcomed(&server, "userId=u1&userKey=k1").await;

    let reply = post(
        &server,
        "/core/ops/ws/send",
        json!({"userId": "u1", "userKey": "k1", "namespace": "work", "data": 5}),
    )
    .await;
    assert_eq!(reply["ok"], true);
    assert_eq!(next_json(&mut work).await, json!({"type": "dispatch", "data": 5}));
    assert_silent(&mut default_ns).await;

    post(&server, "/api/notify", json!({"userId": "u1", "userKey": "k1", "type": "ding"})).await;
    assert_eq!(next_json(&mut work).await, json!({"type": "ding", "data": null}));
    assert_eq!(next_json(&mut default_ns).await["type"], "ding");

    post(&server, "/core/ops/broadcast", json!({"userId": "u1", "userKey": "k1", "data": [1]})).await;
    assert_eq!(next_json(&mut work).await["data"], json!([1]));
    assert_eq!(next_json(&mut default_ns).await["data"], json!([1]));
}

#[tokio::test]
async fn test_register_then_connect() {
    let server = spawn_server(&USERS).await;

    let reply = post(&server, "/core/auth/register", json!({"userId": "new", "userKey": "pw"})).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["user"]["userId"], "new");

    let again = post(&server, "/core/auth/register", json!({"userId": "new", "userKey": "pw"})).await;
    assert_eq!(again["ok"], true);
    let clash = post(&server, "/core/auth/register", json!({"userId": "new", "userKey": "other"})).await;
    assert_eq!(clash["ok"], false);

    let (_ws, welcome) = connect_welcomed(&server, "userId=new&userKey=pw").await;
    assert_eq!(welcome["userId"], "new");
}

#[tokio::test]
async fn test_network_status_without_upstream() {
    let server = spawn_server(&USERS).await;
    let (_device, _) = connect_welcomed(&server, "userId=u1&userKey=k1&mode=reverse&deviceId=d").await;

    let status: Value = reqwest::get(server.http_url("/core/network/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["upstream"], json!({"upstreamEnabled": false}));
    assert_eq!(status["reverseDevices"], 1);
}
