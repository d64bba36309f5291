use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::EnvFilter;

use mesh_common::signal::shutdown_signal;
use mesh_ingest::config::Config;
use mesh_ingest::server::serve;

async fn shutdown() {
    if let Err(e) = shutdown_signal().await {
        error!("failed to listen for shutdown signals: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().context("failed to load configuration from env")?;

    let listener = TcpListener::bind(config.bind())
        .await
        .with_context(|| format!("failed to bind {}", config.bind()))?;

    serve(config, listener, shutdown()).await
}
