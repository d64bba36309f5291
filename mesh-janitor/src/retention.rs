//! Scheduled deletion of aged events and inactive nodes.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mesh_common::event::EventCategory;
use mesh_common::store::{Store, StoreError};
use mesh_common::time::Clock;

use crate::config::RetentionConfig;

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("{sweep} sweep failed: {error}")]
    SweepFailed { sweep: String, error: StoreError },
}

/// How long data is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub data_retention_enabled: bool,
    pub retention_days: u32,
    pub overrides: HashMap<EventCategory, u32>,
    pub node_cleanup_enabled: bool,
    pub node_cleanup_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            data_retention_enabled: true,
            retention_days: 30,
            overrides: HashMap::new(),
            node_cleanup_enabled: true,
            node_cleanup_days: 7,
        }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            data_retention_enabled: config.data_retention_enabled,
            retention_days: config.data_retention_days,
            overrides: config.overrides(),
            node_cleanup_enabled: config.node_cleanup_enabled,
            node_cleanup_days: config.node_cleanup_days,
        }
    }
}

impl RetentionPolicy {
    pub fn retention_days(&self, category: EventCategory) -> u32 {
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or(self.retention_days)
    }

    pub fn event_cutoff(&self, category: EventCategory, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.retention_days(category)))
    }

    pub fn node_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.node_cleanup_days))
    }
}

/// What a single run deleted, or would have deleted on a dry run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    /// Per-category counts, only for categories that were swept.
    pub events: BTreeMap<String, u64>,
    pub nodes: u64,
    pub duration_ms: u64,
}

impl RetentionReport {
    pub fn events_total(&self) -> u64 {
        self.events.values().sum()
    }
}

/// Runs retention sweeps against a store. Runs are serialized: a run started while another one
/// is in progress waits for it to finish.
pub struct RetentionSweeper {
    store: Arc<dyn Store>,
    policy: RetentionPolicy,
    clock: Arc<dyn Clock>,
    guard: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn Store>, policy: RetentionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Whether a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    pub async fn run(&self, dry_run: bool) -> Result<RetentionReport, RetentionError> {
        let _running = self.guard.lock().await;
        let start = time::Instant::now();

        let result = self.sweep(dry_run).await;

        let elapsed = start.elapsed();
        metrics::histogram!("retention_run_duration_seconds").record(elapsed.as_secs_f64());
        let outcome = match &result {
            Ok(_) => "success",
            Err(_) => "error",
        };
        metrics::counter!("retention_runs_total", "result" => outcome).increment(1);

        result.map(|mut report| {
            report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
            report
        })
    }

    async fn sweep(&self, dry_run: bool) -> Result<RetentionReport, RetentionError> {
        let now = self.clock.now();
        let mut report = RetentionReport {
            dry_run,
            ..Default::default()
        };

        if self.policy.data_retention_enabled {
            for category in EventCategory::ALL {
                let cutoff = self.policy.event_cutoff(category, now);
                let count = if dry_run {
                    self.store.count_older_than(category, cutoff).await
                } else {
                    self.store.delete_older_than(category, cutoff).await
                }
                .map_err(|error| RetentionError::SweepFailed {
                    sweep: format!("{} event", category),
                    error,
                })?;

                if !dry_run {
                    metrics::counter!("retention_deleted_total", "table" => category.as_str())
                        .increment(count);
                }
                report.events.insert(category.as_str().to_owned(), count);
            }
        }

        if self.policy.node_cleanup_enabled {
            let cutoff = self.policy.node_cutoff(now);
            let count = if dry_run {
                self.store.count_inactive_nodes(cutoff).await
            } else {
                self.store.delete_inactive_nodes(cutoff).await
            }
            .map_err(|error| RetentionError::SweepFailed {
                sweep: "node".to_owned(),
                error,
            })?;

            if !dry_run {
                metrics::counter!("retention_deleted_total", "table" => "nodes").increment(count);
            }
            report.nodes = count;
        }

        Ok(report)
    }
}

/// Run the sweeper every `period` until `shutdown` is cancelled. The first run starts
/// immediately. A failed run is logged and retried on the next tick.
pub async fn retention_loop(
    sweeper: Arc<RetentionSweeper>,
    period: time::Duration,
    dry_run: bool,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = sweeper.run(dry_run) => match result {
                Ok(report) => info!(
                    dry_run = report.dry_run,
                    events = report.events_total(),
                    nodes = report.nodes,
                    duration_ms = report.duration_ms,
                    "retention run finished"
                ),
                Err(error) => error!("retention run failed, retrying next tick: {}", error),
            }
        }
    }

    info!("retention scheduler stopped");
}
