//! Upstream peer client
//!
//! Registers this process as a reverse device on a remote hub, failing over
//! between candidate endpoints and backing off when the remote rejects our
//! credentials.

pub mod client;
pub mod config;
pub mod endpoints;
pub mod machine;

pub use client::{MessageHandler, UpstreamHandle, UpstreamStatus};
pub use config::UpstreamConfig;
pub use endpoints::LocalHosts;

use tracing::{error, info, warn};

use crate::auth::mask;
use crate::config::EndpointConfig;
use crate::diagnostics::Diagnostics;
use crate::tls::upstream_connector;

/// Start the client from the endpoint config and the process environment.
///
/// Returns `None` (inert) when the roles exclude the client, the upstream is
/// disabled or incomplete, or every candidate points back at this host.
/// Must be called from within a Tokio runtime.
pub fn start(
    endpoint: &EndpointConfig,
    on_message: Option<MessageHandler>,
    diagnostics: Diagnostics,
) -> Option<UpstreamHandle> {
    start_with(endpoint, config::process_env, &LocalHosts::detect(), on_message, diagnostics)
}

/// [`start`] with an injected environment and local host set
pub fn start_with<F>(
    endpoint: &EndpointConfig,
    env: F,
    local_hosts: &LocalHosts,
    on_message: Option<MessageHandler>,
    diagnostics: Diagnostics,
) -> Option<UpstreamHandle>
where
    F: Fn(&str) -> Option<String>,
{
    if !endpoint.client_role_enabled() {
        info!("Upstream disabled: roles {:?} exclude the peer client", endpoint.roles);
        return None;
    }

    let cfg = match UpstreamConfig::normalize(&endpoint.upstream, env) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => return None,
        Err(e) => {
            error!("Upstream disabled: {:#}", e);
            return None;
        }
    };
    info!(
        "Upstream config accepted: userId={} endpoint={} namespace={} deviceId={} encrypted={}",
        mask(&cfg.user_id),
        cfg.endpoint_url,
        cfg.namespace,
        cfg.device_id,
        cfg.keys.is_some()
    );

    let candidates = endpoints::resolve_candidates(&cfg, local_hosts);
    if candidates.is_empty() {
        warn!(
            "Upstream disabled: all candidates are local endpoints (hosts={})",
            local_hosts.iter().cloned().collect::<Vec<_>>().join("|")
        );
        return None;
    }

    let connector = match upstream_connector(cfg.reject_unauthorized) {
        Ok(connector) => connector,
        Err(e) => {
            error!("Upstream disabled: {:#}", e);
            return None;
        }
    };

    Some(client::spawn(cfg, candidates, connector, on_message, diagnostics))
}
