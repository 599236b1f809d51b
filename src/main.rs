use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

mod api;
mod auth;
mod channel;
mod config;
mod db;
mod error;
mod history;
mod identity;
mod models;
mod protocol;
mod relay;
mod transmission;
mod welcome;

use crate::config::AppConfig;
use crate::relay::RelayState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }

    tracing::info!("Starting walkie-relay v{}", env!("CARGO_PKG_VERSION"));

    auth::ensure_keypair(&config.auth)?;

    let db_pool = db::init_pool(&config.database).await?;
    tracing::info!("Database connected");

    db::run_migrations(&db_pool).await?;
    tracing::info!("Migrations complete");

    let state = RelayState::new(db_pool, config.clone());
    let app = api::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Relay listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("walkie-relay stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
