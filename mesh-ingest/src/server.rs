use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mesh_common::metrics::{setup_metrics_recorder, setup_metrics_routes};
use mesh_common::store;
use mesh_common::time::SystemClock;
use mesh_janitor::retention::{retention_loop, RetentionPolicy, RetentionSweeper};
use mesh_worker::relay::WebhookRelay;

use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::live::LiveHub;
use crate::router::router;
use crate::sink::Distributor;
use crate::subscriber::TopicRouter;

/// Run the whole pipeline and its HTTP server until `shutdown` resolves or the broker
/// subscriber gives up, then wind everything down in order within the shutdown timeout.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let store = store::connect(config.database_url.as_deref(), config.max_pg_connections)
        .await
        .context("failed to open store")?;

    let live = LiveHub::new(config.live_viewer_buffer);

    let relay = WebhookRelay::new(&config.webhook).context("invalid webhook configuration")?;
    let relay = if relay.has_targets() {
        Some(Arc::new(relay))
    } else {
        info!("no webhook targets configured");
        None
    };

    let distributor = Arc::new(Distributor::new(
        store.clone(),
        config.dedup.persist_attempts,
        config.dedup.persist_retry.0,
        relay.clone(),
        live.clone(),
    ));
    let (dedup, dedup_task) = Deduplicator::spawn(&config.dedup, distributor);

    let stop = CancellationToken::new();

    let sweeper = config.retention_enabled.then(|| {
        Arc::new(RetentionSweeper::new(
            store.clone(),
            RetentionPolicy::from(&config.retention),
            Arc::new(SystemClock {}),
        ))
    });
    let retention = sweeper.clone().map(|sweeper| {
        tokio::spawn(retention_loop(
            sweeper,
            config.retention.interval.0,
            config.retention.dry_run,
            stop.child_token(),
        ))
    });

    let broker_connected = Arc::new(AtomicBool::new(false));
    let topic_router = TopicRouter::new(
        config.broker.topic_prefix.as_str(),
        Arc::new(SystemClock {}),
        dedup,
    );
    let mut subscriber = tokio::spawn(topic_router.run(
        config.broker.clone(),
        broker_connected.clone(),
        stop.child_token(),
    ));

    let app = router(live.clone(), broker_connected, sweeper);
    // Installing the global recorder more than once per process fails, so embedders and tests
    // leave it off.
    let app = if config.export_prometheus {
        let recorder_handle =
            setup_metrics_recorder().context("failed to install metrics recorder")?;
        setup_metrics_routes(app, recorder_handle)
    } else {
        app
    };

    info!("listening on {}", listener.local_addr()?);
    let http_stop = CancellationToken::new();
    let http_shutdown = http_stop.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    let mut fatal = None;
    let mut subscriber_done = false;
    tokio::select! {
        _ = shutdown => info!("shutdown requested"),
        joined = &mut subscriber => {
            subscriber_done = true;
            fatal = Some(match joined {
                Ok(Ok(())) => anyhow!("broker subscriber stopped unexpectedly"),
                Ok(Err(e)) => anyhow::Error::new(e).context("broker subscriber failed"),
                Err(e) => anyhow::Error::new(e).context("broker subscriber panicked"),
            });
        }
    }

    let drained = tokio::time::timeout(config.shutdown_timeout(), async {
        stop.cancel();

        if !subscriber_done {
            match subscriber.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("broker subscriber failed while stopping: {}", e),
                Err(e) => error!("broker subscriber panicked: {}", e),
            }
        }

        // The subscriber held the last handle, so the deduplicator is flushing now.
        if let Err(e) = dedup_task.await {
            error!("deduplicator failed: {}", e);
        }

        if let Some(relay) = &relay {
            relay.shutdown().await;
        }

        live.close_all();
        http_stop.cancel();
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("http server failed: {}", e),
            Err(e) => error!("http server panicked: {}", e),
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout = ?config.shutdown_timeout(),
            "shutdown did not finish in time, abandoning remaining work"
        );
    }

    // Retention need not finish before exit.
    if let Some(retention) = retention {
        retention.abort();
    }

    info!("mesh ingest stopped");
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
