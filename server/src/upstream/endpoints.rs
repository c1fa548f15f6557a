//! Candidate endpoint resolution
//!
//! A fleet can share one list of possible upstreams. Each node drops the
//! candidates that point back at itself and collapses candidates that name
//! the same `host:port`.

use std::collections::HashSet;

use tracing::{debug, info};
use url::Url;

use super::config::UpstreamConfig;

/// Host names and addresses that identify this machine
#[derive(Debug, Clone, Default)]
pub struct LocalHosts(HashSet<String>);

fn normalize_host(value: &str) -> String {
    let raw = value.trim();
    let without_zone = raw.split('%').next().unwrap_or(raw);
    let unbracketed = without_zone
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(without_zone);
    unbracketed.to_lowercase()
}

impl LocalHosts {
    /// Loopback names, the hostname and every interface address
    pub fn detect() -> Self {
        let mut hosts = LocalHosts::from_iter(["localhost", "127.0.0.1", "::1"]);
        hosts.insert(&gethostname::gethostname().to_string_lossy());
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                for iface in interfaces {
                    hosts.insert(&iface.ip().to_string());
                }
            }
            Err(e) => debug!("Could not list network interfaces: {}", e),
        }
        hosts
    }

    pub fn insert(&mut self, host: &str) {
        let host = normalize_host(host);
        if !host.is_empty() {
            self.0.insert(host);
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(&normalize_host(host))
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl<'a> FromIterator<&'a str> for LocalHosts {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut hosts = LocalHosts::default();
        for host in iter {
            hosts.insert(host);
        }
        hosts
    }
}

/// Parse a candidate, assuming `https://` when no scheme is given
fn parse_candidate(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains("://") {
        Url::parse(raw).ok()
    } else {
        Url::parse(&format!("https://{raw}")).ok()
    }
}

fn url_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(normalize_host)
        .filter(|h| !h.is_empty())
}

/// Blank candidates count as self-loops; unparseable ones do not.
pub fn is_self_loop(endpoint: &str, local: &LocalHosts) -> bool {
    if endpoint.trim().is_empty() {
        return true;
    }
    parse_candidate(endpoint)
        .and_then(|url| url_host(&url))
        .map(|host| local.contains(&host))
        .unwrap_or(false)
}

/// `host:port` with the scheme's default port filled in
pub fn endpoint_signature(endpoint: &str) -> Option<String> {
    let url = parse_candidate(endpoint)?;
    let host = url_host(&url)?;
    let port = url
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();
    Some(format!("{host}:{port}"))
}

/// Ordered, filtered candidate list: the primary endpoint first, then the
/// extra endpoints.
pub fn resolve_candidates(cfg: &UpstreamConfig, local: &LocalHosts) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let raw = std::iter::once(cfg.endpoint_url.as_str()).chain(cfg.endpoints.iter().map(String::as_str));
    for item in raw.map(str::trim).filter(|i| !i.is_empty()) {
        if is_self_loop(item, local) {
            if cfg.tunnel_debug {
                info!("Skipping self endpoint candidate {}", item);
            } else {
                debug!("Skipping self endpoint candidate {}", item);
            }
            continue;
        }
        let signature = endpoint_signature(item);
        if let Some(signature) = &signature {
            if !seen.insert(signature.clone()) {
                debug!("Skipping duplicate endpoint candidate {} ({})", item, signature);
                continue;
            }
        }
        candidates.push(item.to_string());
    }
    candidates
}

const RESERVED_QUERY_KEYS: [&str; 5] = ["mode", "userId", "userKey", "namespace", "deviceId"];

/// WebSocket URL for a candidate: `http(s)` becomes `ws(s)`, the path gets
/// a trailing `/ws` unless it already has one, and the reverse-mode
/// handshake parameters are set.
pub fn build_ws_url(endpoint: &str, cfg: &UpstreamConfig) -> Option<String> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let mut url = parse_candidate(trimmed)?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;

    let path = url.path().to_string();
    let has_ws_path = path.ends_with("/ws") || path.contains("/ws/");
    if !has_ws_path {
        let base = if path.ends_with('/') { path } else { format!("{path}/") };
        url.set_path(&format!("{base}ws"));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !RESERVED_QUERY_KEYS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("mode", "reverse")
        .append_pair("userId", &cfg.user_id)
        .append_pair("userKey", &cfg.user_key)
        .append_pair("namespace", &cfg.namespace)
        .append_pair("deviceId", &cfg.device_id);

    Some(url.to_string())
}
