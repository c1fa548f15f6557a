//! Upstream peer configuration
//!
//! File settings come from the `upstream` section of the endpoint config;
//! `AIRPAD_UPSTREAM_*` variables take precedence. The environment is read
//! through a lookup closure so normalization can be tested without touching
//! the process environment.

use std::fmt;
use std::time::Duration;

use airpad_relay_shared::EnvelopeKeys;
use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::auth::mask;
use crate::config::{parse_bool, parse_list, UpstreamFileConfig};

pub const DEFAULT_RECONNECT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 12_000;
pub const DEFAULT_HEARTBEAT_MS: u64 = 20_000;
pub const DEFAULT_INVALID_CREDENTIALS_RETRY_MS: u64 = 30_000;
pub const MIN_INVALID_CREDENTIALS_RETRY_MS: u64 = 1_000;
pub const DEFAULT_NAMESPACE: &str = "default";

/// Reads `std::env`
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Normalized, validated upstream settings
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Primary endpoint; the first candidate tried
    pub endpoint_url: String,
    /// Extra candidates, deduplicated by exact text
    pub endpoints: Vec<String>,
    pub user_id: String,
    pub user_key: String,
    pub device_id: String,
    pub namespace: String,
    pub reconnect: Duration,
    pub connect_timeout: Duration,
    pub heartbeat: Duration,
    /// Close after this many heartbeats without inbound traffic; 0 disables
    pub max_missed_pongs: u32,
    pub invalid_credentials_retry: Duration,
    pub reject_unauthorized: bool,
    /// Promote connectivity logs from debug to info/warn
    pub tunnel_debug: bool,
    /// Present when a master key is configured
    pub keys: Option<EnvelopeKeys>,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("endpoints", &self.endpoints)
            .field("user_id", &mask(&self.user_id))
            .field("user_key", &mask(&self.user_key))
            .field("device_id", &self.device_id)
            .field("namespace", &self.namespace)
            .field("reconnect", &self.reconnect)
            .field("encrypted", &self.keys.is_some())
            .finish()
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn positive_ms(value: Option<String>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
}

fn random_device_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("endpoint-{}", &id[..12])
}

impl UpstreamConfig {
    /// Merge file settings with the environment.
    ///
    /// `Ok(None)` when the client is disabled or a required field
    /// (endpoint, user id, user key) is missing. Unparseable key material is
    /// an error.
    pub fn normalize<F>(file: &UpstreamFileConfig, env: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tunnel_debug = env("AIRPAD_TUNNEL_DEBUG")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(false);
        let enabled = env("AIRPAD_UPSTREAM_ENABLED")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(file.enabled == Some(true));

        let env_endpoints = env("AIRPAD_UPSTREAM_ENDPOINTS")
            .map(|v| parse_list(&v))
            .unwrap_or_default();
        let entries: Vec<String> = if !env_endpoints.is_empty() {
            env_endpoints
        } else if let Some(list) = &file.endpoints {
            list.clone()
        } else {
            file.endpoint_url.iter().cloned().collect()
        };
        let mut endpoints: Vec<String> = Vec::new();
        for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            if !endpoints.iter().any(|known| known == entry) {
                endpoints.push(entry.to_string());
            }
        }

        let endpoint_url = trimmed(env("AIRPAD_UPSTREAM_ENDPOINT_URL"))
            .or_else(|| trimmed(file.endpoint_url.clone()))
            .or_else(|| endpoints.first().cloned())
            .unwrap_or_default();
        let user_id = trimmed(env("AIRPAD_UPSTREAM_USER_ID"))
            .or_else(|| trimmed(file.user_id.clone()))
            .unwrap_or_default();
        let user_key = trimmed(env("AIRPAD_UPSTREAM_USER_KEY"))
            .or_else(|| trimmed(file.user_key.clone()))
            .unwrap_or_default();

        if !enabled {
            if tunnel_debug {
                info!(
                    "Upstream disabled: enabled=false endpointUrl={} userId={}",
                    if endpoint_url.is_empty() { "-" } else { &endpoint_url },
                    mask(&user_id)
                );
            }
            return Ok(None);
        }

        let missing: Vec<&str> = [
            ("endpointUrl", endpoint_url.is_empty()),
            ("userId", user_id.is_empty()),
            ("userKey", user_key.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, absent)| absent.then_some(name))
        .collect();
        if !missing.is_empty() {
            warn!("Upstream disabled: missing required fields {}", missing.join(","));
            return Ok(None);
        }

        let keys = EnvelopeKeys::from_config(
            file.upstream_master_key.as_deref(),
            file.upstream_signing_private_key_pem.as_deref(),
            file.upstream_peer_public_key_pem.as_deref(),
        )
        .context("Invalid upstream envelope key material")?;

        let reconnect_ms = positive_ms(env("AIRPAD_UPSTREAM_RECONNECT_MS"))
            .or(file.reconnect_ms.filter(|ms| *ms > 0))
            .unwrap_or(DEFAULT_RECONNECT_MS);
        let retry_ms = positive_ms(env("AIRPAD_UPSTREAM_INVALID_CREDENTIALS_RETRY_MS"))
            .unwrap_or(DEFAULT_INVALID_CREDENTIALS_RETRY_MS)
            .max(MIN_INVALID_CREDENTIALS_RETRY_MS);

        Ok(Some(UpstreamConfig {
            endpoint_url,
            endpoints,
            user_id,
            user_key,
            device_id: trimmed(env("AIRPAD_UPSTREAM_DEVICE_ID"))
                .or_else(|| trimmed(file.device_id.clone()))
                .unwrap_or_else(random_device_id),
            namespace: trimmed(env("AIRPAD_UPSTREAM_NAMESPACE"))
                .or_else(|| trimmed(file.namespace.clone()))
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            reconnect: Duration::from_millis(reconnect_ms),
            connect_timeout: Duration::from_millis(
                positive_ms(env("AIRPAD_UPSTREAM_CONNECT_TIMEOUT_MS"))
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            heartbeat: Duration::from_millis(
                positive_ms(env("AIRPAD_UPSTREAM_HEARTBEAT_MS")).unwrap_or(DEFAULT_HEARTBEAT_MS),
            ),
            max_missed_pongs: env("AIRPAD_UPSTREAM_MAX_MISSED_PONGS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            invalid_credentials_retry: Duration::from_millis(retry_ms),
            reject_unauthorized: env("AIRPAD_UPSTREAM_REJECT_UNAUTHORIZED")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            tunnel_debug,
            keys,
        }))
    }
}
