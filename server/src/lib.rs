//! AirPad relay server
//!
//! A WebSocket hub that multiplexes push clients and addressable reverse
//! devices per user, plus an upstream peer client that registers this node
//! as a reverse device on another hub.

pub mod auth;
pub mod config;
pub mod database;
pub mod db;
pub mod diagnostics;
pub mod hub;
pub mod ops;
pub mod routing;
pub mod tls;
pub mod tunnel;
pub mod upstream;
pub mod websocket;

pub use config::ServerConfig;
pub use diagnostics::{DiagnosticEvent, Diagnostics};
pub use hub::Hub;
pub use websocket::ServerState;
