//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL for the user store
    pub database_url: String,
    /// Transport-level WebSocket ping interval in seconds (0 disables)
    pub ws_ping_interval: u64,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Mount `/core/auth/register`
    pub allow_register: bool,
    /// Endpoint roles and upstream peer settings
    pub endpoint: EndpointConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let endpoint = match env::var("AIRPAD_CONFIG") {
            Ok(path) if !path.trim().is_empty() => EndpointConfig::load(path.trim())?,
            _ => EndpointConfig::default(),
        };

        let config = ServerConfig {
            host: env::var("AIRPAD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("AIRPAD_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid AIRPAD_PORT")?,
            database_url: env::var("AIRPAD_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/airpad.db".to_string()),
            ws_ping_interval: env::var("AIRPAD_WS_PING_INTERVAL")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid AIRPAD_WS_PING_INTERVAL")?,
            cors_origins: env::var("AIRPAD_CORS_ORIGINS").ok(),
            allow_register: env::var("AIRPAD_ALLOW_REGISTER")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            endpoint,
        };

        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            ws_ping_interval: 30,
            cors_origins: None,
            allow_register: true,
            endpoint: EndpointConfig::default(),
        }
    }
}

/// File-level endpoint configuration (`AIRPAD_CONFIG`, JSON)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Deployment roles this process serves; empty means all
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
}

impl EndpointConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read endpoint config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse endpoint config {}", path.display()))
    }

    /// True when the roles list is empty or names a role that runs the
    /// upstream peer client.
    pub fn client_role_enabled(&self) -> bool {
        let roles: Vec<String> = self
            .roles
            .iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect();
        roles.is_empty()
            || roles
                .iter()
                .any(|r| matches!(r.as_str(), "client" | "peer" | "node" | "hub"))
    }
}

/// Raw `upstream` section, before env overrides and normalization
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamFileConfig {
    pub enabled: Option<bool>,
    pub endpoint_url: Option<String>,
    pub endpoints: Option<Vec<String>>,
    pub user_id: Option<String>,
    pub user_key: Option<String>,
    pub device_id: Option<String>,
    pub namespace: Option<String>,
    pub reconnect_ms: Option<u64>,
    pub upstream_master_key: Option<String>,
    pub upstream_signing_private_key_pem: Option<String>,
    pub upstream_peer_public_key_pem: Option<String>,
}

/// `1/true/yes/on` and `0/false/no/off`; anything else is unset
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a `,`/`;` separated list, dropping blanks
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
