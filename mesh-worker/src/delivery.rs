//! The lifecycle of a single webhook delivery.
use std::time;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use mesh_common::event::PublicKey;
use mesh_common::model::Published;
use mesh_common::retry::RetryPolicy;

/// The body posted to every webhook target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub event_type: String,
    pub public_key: PublicKey,
    pub payload: Value,
}

impl From<&Published> for Envelope {
    fn from(published: &Published) -> Self {
        Self {
            event_type: published.event_name().to_owned(),
            public_key: published.public_key().clone(),
            payload: published.payload(),
        }
    }
}

/// Where a delivery is in its lifecycle.
/// Pending: Waiting in the target's queue for its first attempt.
/// InFlight: A request is currently being made.
/// Retrying: The n-th retry is scheduled and waiting on its timer.
/// Delivered: The target answered with a 2xx.
/// Failed: Every allowed attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Retrying(u32),
    Delivered,
    Failed,
}

/// How a delivery left the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    /// Evicted from a full queue, or pushed out by newer retries waiting on their timer.
    Dropped,
    /// Waiting on a retry timer when the relay shut down.
    Cancelled,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::Dropped => "dropped",
            DeliveryOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub url: String,
    pub event_type: String,
    pub attempts: u32,
    /// The delay scheduled before each retry, in order.
    pub delays: Vec<time::Duration>,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub envelope: Envelope,
    pub state: DeliveryState,
    pub attempts: u32,
    pub delays: Vec<time::Duration>,
    pub next_retry_at: Option<Instant>,
}

impl WebhookDelivery {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            state: DeliveryState::Pending,
            attempts: 0,
            delays: Vec::new(),
            next_retry_at: None,
        }
    }

    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        self.state = DeliveryState::InFlight;
        self.next_retry_at = None;
    }

    pub fn delivered(&mut self) {
        self.state = DeliveryState::Delivered;
    }

    pub fn failed(&mut self) {
        self.state = DeliveryState::Failed;
        self.next_retry_at = None;
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or `None` if the
    /// policy is exhausted and the delivery is now `Failed`.
    pub fn schedule_retry(
        &mut self,
        retry_policy: &RetryPolicy,
        retry_after: Option<time::Duration>,
    ) -> Option<time::Duration> {
        let retries = self.attempts.saturating_sub(1);

        if !retry_policy.allows_retry(retries) {
            self.failed();
            return None;
        }

        let delay = retry_policy.retry_interval(retries, retry_after);
        self.delays.push(delay);
        self.state = DeliveryState::Retrying(retries + 1);
        self.next_retry_at = Some(Instant::now() + delay);

        Some(delay)
    }

    pub fn report(&self, url: &str, outcome: DeliveryOutcome) -> DeliveryReport {
        DeliveryReport {
            url: url.to_owned(),
            event_type: self.envelope.event_type.clone(),
            attempts: self.attempts,
            delays: self.delays.clone(),
            outcome,
        }
    }
}
