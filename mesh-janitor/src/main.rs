use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mesh_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use mesh_common::signal::shutdown_signal;
use mesh_common::store;
use mesh_common::time::SystemClock;
use mesh_janitor::config::Config;
use mesh_janitor::handlers;
use mesh_janitor::retention::{retention_loop, RetentionPolicy, RetentionSweeper};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().context("failed to load configuration from env")?;

    let store = store::connect(config.database_url.as_deref(), config.max_pg_connections)
        .await
        .context("failed to open store")?;

    let policy = RetentionPolicy::from(&config.retention);
    info!(?policy, "starting mesh janitor");
    let sweeper = Arc::new(RetentionSweeper::new(store, policy, Arc::new(SystemClock {})));

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(retention_loop(
        sweeper.clone(),
        config.retention.interval.0,
        config.retention.dry_run,
        shutdown.clone(),
    ));

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let app = setup_metrics_routes(handlers::app(sweeper), recorder_handle);

    let server_shutdown = shutdown.clone();
    let served = serve(app, &config.bind(), async move {
        if let Err(e) = shutdown_signal().await {
            error!("failed to listen for shutdown signals: {}", e);
            server_shutdown.cancelled().await;
        }
    })
    .await;

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        error!("retention scheduler failed: {}", e);
    }

    served.context("janitor http server failed")
}
