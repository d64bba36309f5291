use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mesh_common::model::Published;

use crate::config::WebhookConfig;
use crate::delivery::{DeliveryOutcome, DeliveryReport, Envelope, WebhookDelivery};
use crate::error::WebhookError;
use crate::queue::PendingQueue;
use crate::target::{TargetResolver, WebhookTarget};
use crate::worker::{build_client, TargetWorker};

/// Relays published events to their webhook targets. `dispatch` only enqueues, so callers never
/// wait on a target.
pub struct WebhookRelay {
    resolver: TargetResolver,
    queues: HashMap<WebhookTarget, Arc<PendingQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    shutdown: CancellationToken,
}

impl WebhookRelay {
    /// Spawn one worker per distinct configured target. Must be called within a tokio runtime.
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        Self::start(config, None)
    }

    /// Like `new`, additionally reporting the final outcome of every delivery.
    pub fn with_reports(
        config: &WebhookConfig,
        reports: mpsc::UnboundedSender<DeliveryReport>,
    ) -> Result<Self, WebhookError> {
        Self::start(config, Some(reports))
    }

    fn start(
        config: &WebhookConfig,
        reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    ) -> Result<Self, WebhookError> {
        let resolver = TargetResolver::from_config(config)?;
        let client = build_client(config.timeout.0)?;
        let retry_policy = config.retry_policy();
        let shutdown = CancellationToken::new();

        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for target in resolver.targets() {
            info!(url = %target.url, "relaying webhooks");

            let queue = Arc::new(PendingQueue::new(config.queue_capacity));
            let worker = TargetWorker::new(
                target.clone(),
                queue.clone(),
                client.clone(),
                retry_policy.clone(),
                config.max_concurrent,
                config.queue_capacity,
                reports.clone(),
                shutdown.child_token(),
            );

            workers.push(tokio::spawn(worker.run()));
            queues.insert(target, queue);
        }

        Ok(Self {
            resolver,
            queues,
            workers: Mutex::new(workers),
            reports,
            shutdown,
        })
    }

    pub fn has_targets(&self) -> bool {
        !self.queues.is_empty()
    }

    /// Enqueue a delivery for the event's target, if it has one. Never blocks: a full queue
    /// evicts its oldest delivery.
    pub fn dispatch(&self, published: &Published) {
        let Some(target) = self.resolver.resolve(published) else {
            return;
        };
        let Some(queue) = self.queues.get(target) else {
            return;
        };
        if self.shutdown.is_cancelled() {
            debug!(url = %target.url, "relay is shutting down, not relaying");
            return;
        }

        let delivery = WebhookDelivery::new(Envelope::from(published));

        if let Some(evicted) = queue.push(delivery) {
            metrics::counter!("webhook_deliveries_dropped_total", "target" => target.url.to_string())
                .increment(1);
            metrics::counter!("webhook_deliveries_total", "outcome" => DeliveryOutcome::Dropped.as_str())
                .increment(1);
            warn!(
                url = %target.url,
                event_type = evicted.envelope.event_type,
                "webhook queue is full, dropped oldest delivery"
            );

            if let Some(reports) = &self.reports {
                if reports
                    .send(evicted.report(target.url.as_str(), DeliveryOutcome::Dropped))
                    .is_err()
                {
                    debug!("delivery report receiver is gone");
                }
            }
        }
    }

    /// Stop every target worker and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        for worker in workers {
            if let Err(error) = worker.await {
                warn!("webhook worker failed: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Env;
    use std::time::Duration;

    use assert_json_diff::assert_json_eq;
    use chrono::Utc;
    use envconfig::Envconfig;
    use httpmock::prelude::*;
    use serde_json::{json, Map};

    use super::*;
    use mesh_common::event::{EventCategory, PublicKey};
    use mesh_common::model::EventRecord;

    fn config(vars: &[(&str, String)]) -> WebhookConfig {
        let env: Env<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        WebhookConfig::init_from_hashmap(&env).unwrap()
    }

    fn battery() -> Published {
        log_event("battery")
    }

    fn log_event(event_name: &str) -> Published {
        let mut payload = Map::new();
        payload.insert("voltage_mv".to_owned(), json!(4012));

        Published::Event(EventRecord {
            category: EventCategory::Log,
            event_name: event_name.to_owned(),
            receiver: "b".repeat(64).parse::<PublicKey>().unwrap(),
            payload,
            received_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_delivers_envelope_with_secret() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/events")
                .header("X-Webhook-Secret", "s3cret")
                .header("content-type", "application/json");
            then.status(200);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/events")),
                ("WEBHOOK_EVENTS_SECRET", "s3cret".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        relay.dispatch(&battery());
        let report = rx.recv().await.unwrap();

        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 1);
        assert!(report.delays.is_empty());
        mock.assert_hits(1);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_envelope_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/events").json_body(json!({
                "event_type": "battery",
                "public_key": "b".repeat(64),
                "payload": { "voltage_mv": 4012 },
            }));
            then.status(204);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[("WEBHOOK_EVENTS_URL", server.url("/events"))]),
            tx,
        )
        .unwrap();

        let published = battery();
        assert_json_eq!(
            serde_json::to_value(Envelope::from(&published)).unwrap(),
            json!({
                "event_type": "battery",
                "public_key": "b".repeat(64),
                "payload": { "voltage_mv": 4012 },
            })
        );

        relay.dispatch(&published);

        assert_eq!(rx.recv().await.unwrap().outcome, DeliveryOutcome::Delivered);
        mock.assert_hits(1);
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_failed() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/500");
            then.status(500);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/500")),
                ("WEBHOOK_MAX_RETRIES", "2".to_owned()),
                ("WEBHOOK_RETRY_BASE", "10".to_owned()),
                ("WEBHOOK_RETRY_BACKOFF", "2.0".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        relay.dispatch(&battery());
        let report = rx.recv().await.unwrap();

        assert_eq!(report.outcome, DeliveryOutcome::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        mock.assert_hits(3);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovers_after_failures() {
        let server = MockServer::start();
        let mut failing = server.mock(|when, then| {
            when.method(POST).path("/flaky");
            then.status(503);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/flaky")),
                ("WEBHOOK_RETRY_BASE", "200".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        relay.dispatch(&battery());

        // Swap the failing response for a healthy one while the first retry is waiting.
        while failing.hits_async().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        failing.delete();
        let healthy = server.mock(|when, then| {
            when.method(POST).path("/flaky");
            then.status(200);
        });

        let report = rx.recv().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 2);
        healthy.assert_hits(1);

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconfigured_category_is_not_relayed() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });

        let relay = WebhookRelay::new(&config(&[(
            "WEBHOOK_ADVERTISEMENT_URL",
            server.url("/adverts"),
        )]))
        .unwrap();
        assert!(relay.has_targets());

        relay.dispatch(&battery());
        relay.shutdown().await;

        mock.assert_hits(0);
    }

    #[tokio::test]
    async fn test_shutdown_gives_pending_a_final_attempt() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/down");
            then.status(500);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/down")),
                ("WEBHOOK_RETRY_BASE", "60000".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        relay.dispatch(&battery());
        while mock.hits_async().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Give the worker a moment to park the delivery on its retry timer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.shutdown().await;

        let report = rx.recv().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Cancelled);
        assert_eq!(report.attempts, 1);
        mock.assert_hits(1);
    }

    /// Collect every report sent so far, grouped by outcome.
    fn outcomes(
        rx: &mut mpsc::UnboundedReceiver<DeliveryReport>,
    ) -> HashMap<&'static str, Vec<String>> {
        let mut outcomes: HashMap<&'static str, Vec<String>> = HashMap::new();
        while let Ok(report) = rx.try_recv() {
            outcomes
                .entry(report.outcome.as_str())
                .or_default()
                .push(report.event_type);
        }
        outcomes
    }

    #[tokio::test]
    async fn test_saturated_target_drops_oldest_pending() {
        let server = MockServer::start();
        let slow = server.mock(|when, then| {
            when.method(POST).path("/slow");
            then.status(200).delay(Duration::from_millis(500));
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/slow")),
                ("WEBHOOK_MAX_CONCURRENT", "1".to_owned()),
                ("WEBHOOK_QUEUE_CAPACITY", "1".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        relay.dispatch(&log_event("first"));
        while slow.hits_async().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // "first" holds the only slot, so "third" pushes "second" out of the queue.
        relay.dispatch(&log_event("second"));
        relay.dispatch(&log_event("third"));

        let report = rx.recv().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Dropped);
        assert_eq!(report.event_type, "second");
        assert_eq!(report.attempts, 0);

        relay.shutdown().await;

        let mut outcomes = outcomes(&mut rx);
        let mut delivered = outcomes.remove("delivered").unwrap_or_default();
        delivered.sort();
        assert_eq!(delivered, vec!["first", "third"]);
        assert!(outcomes.is_empty(), "unexpected reports: {outcomes:?}");
        slow.assert_hits(2);
    }

    #[tokio::test]
    async fn test_failing_target_keeps_at_most_capacity_retries() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/down");
            then.status(500);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let relay = WebhookRelay::with_reports(
            &config(&[
                ("WEBHOOK_EVENTS_URL", server.url("/down")),
                ("WEBHOOK_QUEUE_CAPACITY", "2".to_owned()),
                ("WEBHOOK_MAX_CONCURRENT", "1".to_owned()),
                ("WEBHOOK_RETRY_BASE", "60000".to_owned()),
            ]),
            tx,
        )
        .unwrap();

        for n in 1..=10 {
            relay.dispatch(&log_event(&format!("event-{n:02}")));
            while mock.hits_async().await < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        // Give the worker a moment to park the last failure.
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.shutdown().await;

        let mut outcomes = outcomes(&mut rx);
        let dropped = outcomes.remove("dropped").unwrap_or_default();
        let mut cancelled = outcomes.remove("cancelled").unwrap_or_default();
        cancelled.sort();

        let expected: Vec<String> = (1..=8).map(|n| format!("event-{n:02}")).collect();
        assert_eq!(dropped, expected);
        assert_eq!(cancelled, vec!["event-09", "event-10"]);
        assert!(outcomes.is_empty(), "unexpected reports: {outcomes:?}");
        mock.assert_hits(10);
    }
}
