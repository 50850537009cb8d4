mod config;
mod db;
mod dispatch;
mod limiter;
mod presence;
mod reaper;
mod routes;
mod state;
mod store;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use db::sqlite::SqliteStore;
use limiter::RateLimiter;
use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "relay_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "relay_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("relay server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize the SQLite-backed message and channel stores
    let db = db::init_db(&config.data_dir)?;
    let store = Arc::new(SqliteStore::new(db));

    let rate_limit = config.rate_limit.clone().unwrap_or_default();
    let reaper_config = config.reaper.clone().unwrap_or_default();

    let app_state = AppState::new(
        RateLimiter::new(rate_limit.settings()),
        store.clone(),
        store,
    );

    // Background stale-session sweep, stopped explicitly on shutdown
    let reaper = reaper::spawn(app_state.clone(), reaper_config.settings());

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    reaper.shutdown().await;
    tracing::info!("relay server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
