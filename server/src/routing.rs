//! HTTP routing configuration

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use airpad_relay_shared::protocol::WS_PATH;
use airpad_relay_shared::PROTOCOL_VERSION;

use crate::ops;
use crate::websocket::ServerState;

/// Create the application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);

    let mut router = Router::new()
        .route(WS_PATH, get(crate::websocket::handle_websocket))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/core/ops/ws/send", post(ops::ws_send))
        .route("/api/ws", post(ops::ws_send))
        .route("/core/reverse/send", post(ops::reverse_send))
        .route("/api/reverse/send", post(ops::reverse_send))
        .route("/core/reverse/devices", post(ops::reverse_devices))
        .route("/api/reverse/devices", post(ops::reverse_devices))
        .route("/core/ops/notify", post(ops::notify))
        .route("/api/notify", post(ops::notify))
        .route("/core/ops/broadcast", post(ops::broadcast))
        .route("/api/broadcast", post(ops::broadcast))
        .route("/core/network/status", get(ops::network_status));

    // Only mount registration when allowed
    if state.config.allow_register {
        router = router.route("/core/auth/register", post(ops::register));
    }

    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Build CORS layer from config. Permissive when no origins are configured.
fn build_cors_layer(origins: &Option<String>) -> CorsLayer {
    match origins {
        Some(list) if !list.trim().is_empty() => {
            let parsed: Vec<_> = list
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
        }
        _ => CorsLayer::permissive(),
    }
}

/// Health check
async fn health_check() -> &'static str {
    "OK"
}

/// Server info: name and protocol version only
async fn server_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "AirPad Relay",
        "protocol_version": PROTOCOL_VERSION,
    }))
}
