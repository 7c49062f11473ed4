use std::sync::Arc;

use parley_server::api::{self, AppState};
use parley_server::config::ServerConfig;
use parley_server::hub::Hub;
use parley_store::Store;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug,parley_store=info")),
        )
        .init();

    info!("Starting Parley hub v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_tokens.is_empty() {
        warn!("AUTH_TOKENS is empty; every WebSocket upgrade will be refused");
    }

    // -----------------------------------------------------------------------
    // 3. Open the store (runs migrations) and start the hub
    // -----------------------------------------------------------------------
    let store = Store::open(&config.database_path, config.pool.clone())?;
    let hub = Hub::spawn(config.broadcast_capacity);

    let app_state = AppState {
        hub,
        store,
        tokens: Arc::new(config.auth_tokens.clone()),
        session: config.session.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server until it fails or we are asked to stop
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
