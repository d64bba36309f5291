use std::collections::BTreeMap;
use std::sync::Arc;
use std::time;

use futures::StreamExt;
use reqwest::header;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use mesh_common::retry::RetryPolicy;

use crate::delivery::{DeliveryOutcome, DeliveryReport, Envelope, WebhookDelivery};
use crate::error::WebhookError;
use crate::queue::PendingQueue;
use crate::target::WebhookTarget;

pub const SECRET_HEADER: &str = "X-Webhook-Secret";

type AttemptResult = (WebhookDelivery, Result<(), WebhookError>);

/// Deliveries waiting on their retry timer, at most `capacity` of them. Ids grow with every
/// insert, so the first entry is always the delivery that has been parked the longest.
struct RetryTimers {
    timers: DelayQueue<u64>,
    parked: BTreeMap<u64, (delay_queue::Key, WebhookDelivery)>,
    capacity: usize,
    next_id: u64,
}

impl RetryTimers {
    fn new(capacity: usize) -> Self {
        Self {
            timers: DelayQueue::new(),
            parked: BTreeMap::new(),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Park a delivery, returning the oldest parked one if that went over capacity.
    fn insert(
        &mut self,
        delivery: WebhookDelivery,
        delay: time::Duration,
    ) -> Option<WebhookDelivery> {
        let evicted = if self.parked.len() >= self.capacity {
            self.parked.pop_first().map(|(_, (key, evicted))| {
                self.timers.remove(&key);
                evicted
            })
        } else {
            None
        };

        let id = self.next_id;
        self.next_id += 1;
        let key = self.timers.insert(id, delay);
        self.parked.insert(id, (key, delivery));

        evicted
    }

    /// Wait for the next delivery whose timer expired.
    async fn next(&mut self) -> Option<WebhookDelivery> {
        let expired = self.timers.next().await?;
        self.parked
            .remove(expired.get_ref())
            .map(|(_, delivery)| delivery)
    }

    fn len(&self) -> usize {
        self.parked.len()
    }

    fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    fn cancel_all(&mut self) -> Vec<WebhookDelivery> {
        self.timers.clear();
        std::mem::take(&mut self.parked)
            .into_values()
            .map(|(_, delivery)| delivery)
            .collect()
    }
}

/// Build the HTTP client shared by every target.
pub fn build_client(request_timeout: time::Duration) -> Result<reqwest::Client, WebhookError> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("Mesh Webhook Relay")
        .timeout(request_timeout)
        .build()
        .map_err(WebhookError::ClientError)
}

/// Drives every delivery for one target: pulls pending deliveries off the queue, keeps at most
/// `max_concurrent` requests in flight, and parks failed deliveries on a retry timer. At most
/// `capacity` deliveries wait on retry timers; past that the oldest one is dropped.
pub struct TargetWorker {
    target: WebhookTarget,
    queue: Arc<PendingQueue>,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
    max_concurrent: usize,
    capacity: usize,
    reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
    shutdown: CancellationToken,
}

impl TargetWorker {
    pub fn new(
        target: WebhookTarget,
        queue: Arc<PendingQueue>,
        client: reqwest::Client,
        retry_policy: RetryPolicy,
        max_concurrent: usize,
        capacity: usize,
        reports: Option<mpsc::UnboundedSender<DeliveryReport>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            queue,
            client,
            retry_policy,
            max_concurrent: max_concurrent.max(1),
            capacity,
            reports,
            shutdown,
        }
    }

    fn url(&self) -> &str {
        self.target.url.as_str()
    }

    /// Run until the shutdown token is cancelled, then wind down: retries still waiting on their
    /// timer are cancelled, pending deliveries get one final attempt, in-flight ones are awaited.
    pub async fn run(self) {
        let mut retries = RetryTimers::new(self.capacity);
        let mut in_flight: JoinSet<AttemptResult> = JoinSet::new();

        loop {
            self.fill(&mut in_flight);
            metrics::gauge!("webhook_deliveries_in_flight", "target" => self.url().to_owned())
                .set(in_flight.len() as f64);
            metrics::gauge!("webhook_deliveries_pending", "target" => self.url().to_owned())
                .set(self.queue.len() as f64);
            metrics::gauge!("webhook_deliveries_retrying", "target" => self.url().to_owned())
                .set(retries.len() as f64);

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.settle(joined, Some(&mut retries));
                }

                Some(delivery) = retries.next(), if !retries.is_empty() && in_flight.len() < self.max_concurrent => {
                    self.spawn_attempt(&mut in_flight, delivery);
                }

                _ = self.queue.notified(), if in_flight.len() < self.max_concurrent => {}
            }
        }

        let cancelled = retries.cancel_all();
        if !cancelled.is_empty() {
            metrics::counter!("webhook_deliveries_total", "outcome" => DeliveryOutcome::Cancelled.as_str())
                .increment(cancelled.len() as u64);
            warn!(
                url = self.url(),
                cancelled = cancelled.len(),
                "cancelled webhook retries on shutdown"
            );
        }
        for mut delivery in cancelled {
            delivery.failed();
            self.send_report(delivery.report(self.url(), DeliveryOutcome::Cancelled));
        }

        let pending = self.queue.drain();
        if !pending.is_empty() {
            info!(
                url = self.url(),
                pending = pending.len(),
                "making a final attempt for pending webhooks"
            );
        }
        for delivery in pending {
            while in_flight.len() >= self.max_concurrent {
                match in_flight.join_next().await {
                    Some(joined) => self.settle(joined, None),
                    None => break,
                }
            }
            self.spawn_attempt(&mut in_flight, delivery);
        }

        while let Some(joined) = in_flight.join_next().await {
            self.settle(joined, None);
        }
    }

    /// Start first attempts for queued deliveries while there is capacity.
    fn fill(&self, in_flight: &mut JoinSet<AttemptResult>) {
        while in_flight.len() < self.max_concurrent {
            match self.queue.pop() {
                Some(delivery) => self.spawn_attempt(in_flight, delivery),
                None => break,
            }
        }
    }

    fn spawn_attempt(&self, in_flight: &mut JoinSet<AttemptResult>, mut delivery: WebhookDelivery) {
        delivery.start_attempt();

        let client = self.client.clone();
        let target = self.target.clone();

        in_flight.spawn(async move {
            let labels = [("target", target.url.to_string())];
            let now = tokio::time::Instant::now();

            let result = send_webhook(&client, &target, &delivery.envelope)
                .await
                .map(|_| ());

            metrics::histogram!("webhook_delivery_duration_seconds", &labels)
                .record(now.elapsed().as_secs_f64());

            (delivery, result)
        });
    }

    /// Move a finished attempt to its next state. Without a retry queue, failures are final.
    fn settle(
        &self,
        joined: Result<AttemptResult, tokio::task::JoinError>,
        retries: Option<&mut RetryTimers>,
    ) {
        let (mut delivery, result) = match joined {
            Ok(attempt) => attempt,
            Err(join_error) => {
                error!(url = self.url(), "webhook attempt task failed: {}", join_error);
                return;
            }
        };

        let error = match result {
            Ok(()) => {
                delivery.delivered();
                debug!(
                    url = self.url(),
                    event_type = delivery.envelope.event_type,
                    attempts = delivery.attempts,
                    "webhook delivered"
                );
                self.finish(&delivery, DeliveryOutcome::Delivered);
                return;
            }
            Err(error) => error,
        };

        let delay = if retries.is_some() {
            delivery.schedule_retry(&self.retry_policy, error.retry_after())
        } else {
            delivery.failed();
            None
        };

        match (delay, retries) {
            (Some(delay), Some(retries)) => {
                metrics::counter!("webhook_deliveries_retried_total", "target" => self.url().to_owned())
                    .increment(1);
                debug!(
                    url = self.url(),
                    attempts = delivery.attempts,
                    ?delay,
                    "webhook attempt failed, retrying: {}",
                    error
                );
                if let Some(mut evicted) = retries.insert(delivery, delay) {
                    evicted.failed();
                    warn!(
                        url = self.url(),
                        event_type = evicted.envelope.event_type,
                        attempts = evicted.attempts,
                        "too many webhook retries waiting, dropped oldest delivery"
                    );
                    self.drop_delivery(&evicted);
                }
            }
            _ => {
                warn!(
                    url = self.url(),
                    event_type = delivery.envelope.event_type,
                    attempts = delivery.attempts,
                    "webhook delivery failed: {}",
                    error
                );
                self.finish(&delivery, DeliveryOutcome::Failed);
            }
        }
    }

    fn drop_delivery(&self, delivery: &WebhookDelivery) {
        metrics::counter!("webhook_deliveries_dropped_total", "target" => self.url().to_owned())
            .increment(1);
        self.finish(delivery, DeliveryOutcome::Dropped);
    }

    fn finish(&self, delivery: &WebhookDelivery, outcome: DeliveryOutcome) {
        metrics::counter!("webhook_deliveries_total", "outcome" => outcome.as_str()).increment(1);
        self.send_report(delivery.report(self.url(), outcome));
    }

    fn send_report(&self, report: DeliveryReport) {
        if let Some(reports) = &self.reports {
            if reports.send(report).is_err() {
                debug!(url = self.url(), "delivery report receiver is gone");
            }
        }
    }
}

/// Make an HTTP POST with the envelope to a webhook target.
/// Any non-2xx status and any transport error is retryable.
pub async fn send_webhook(
    client: &reqwest::Client,
    target: &WebhookTarget,
    envelope: &Envelope,
) -> Result<reqwest::Response, WebhookError> {
    let mut request = client.post(target.url.clone()).json(envelope);
    if let Some(secret) = &target.secret {
        request = request.header(SECRET_HEADER, secret.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|error| WebhookError::RetryableRequestError {
            error,
            retry_after: None,
        })?;

    let retry_after = parse_retry_after_header(response.headers());

    response
        .error_for_status()
        .map_err(|error| WebhookError::RetryableRequestError { error, retry_after })
}

/// Attempt to parse a std Duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}
