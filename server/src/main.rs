use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

// Use jemalloc on Linux for reduced fragmentation on long-running relays.
// On Windows/macOS the default system allocator is used instead.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use airpad_relay::db::SqliteUserStore;
use airpad_relay::{database, routing, tls, tunnel, upstream};
use airpad_relay::{Diagnostics, Hub, ServerConfig, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("airpad_relay=debug".parse()?)
                .add_directive("airpad_relay_shared=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting AirPad relay");
    tls::ensure_crypto_provider();

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let db_pool = database::init(&config.database_url).await?;
    info!("Database initialized");

    let diagnostics = Diagnostics::new();
    let hub = Arc::new(Hub::new(diagnostics.clone()));

    let upstream = upstream::start(
        &config.endpoint,
        Some(tunnel::hub_handler(hub.clone())),
        diagnostics.clone(),
    );
    if upstream.is_some() {
        info!("Upstream peer bridge started");
    }

    let mut state = ServerState::new(
        config.clone(),
        hub.clone(),
        Arc::new(SqliteUserStore::new(db_pool.clone())),
        diagnostics,
    );
    if let Some(handle) = upstream.clone() {
        state = state.with_upstream(handle);
    }

    let app = routing::create_router(Arc::new(state));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    // Graceful shutdown: close hub sockets so the server can drain
    let shutdown_hub = hub.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, closing connections...");
        shutdown_hub.close();
    };

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    if let Some(handle) = upstream {
        handle.stop();
    }
    hub.close();

    db_pool.close().await;
    info!("Server stopped cleanly");
    Ok(())
}
