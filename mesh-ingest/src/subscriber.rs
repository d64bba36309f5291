use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mesh_common::event::{parse_topic, subscription_filter, MeshEvent, ParseError};
use mesh_common::retry::RetryPolicy;
use mesh_common::time::Clock;

use crate::config::BrokerConfig;
use crate::dedup::DedupHandle;
use crate::error::IngestError;

/// Turns broker messages into typed events and hands them to the deduplicator.
pub struct TopicRouter {
    prefix: String,
    clock: Arc<dyn Clock>,
    dedup: DedupHandle,
}

impl TopicRouter {
    pub fn new(prefix: &str, clock: Arc<dyn Clock>, dedup: DedupHandle) -> Self {
        Self {
            prefix: prefix.to_owned(),
            clock,
            dedup,
        }
    }

    /// Decode a message, stamping it with the local receipt time.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<MeshEvent, ParseError> {
        let received_at = self.clock.now();
        let topic = parse_topic(&self.prefix, topic)?;
        MeshEvent::decode(topic, payload, received_at)
    }

    /// Route one message. Malformed messages are counted and dropped; only a stopped
    /// deduplicator is an error.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        metrics::counter!("mesh_ingest_messages_total").increment(1);

        match self.decode(topic, payload) {
            Ok(event) => self.dedup.submit(event).await,
            Err(e) => {
                metrics::counter!("mesh_ingest_parse_errors_total", "reason" => e.reason())
                    .increment(1);
                warn!(topic, "dropping malformed message: {}", e);
                Ok(())
            }
        }
    }

    /// Subscribe and route until `shutdown` is cancelled. `connected` reflects whether the
    /// subscription is currently live.
    pub async fn run(
        self,
        config: BrokerConfig,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Result<(), IngestError> {
        let mut options = MqttOptions::new(config.client_id.as_str(), &config.host, config.port);
        options.set_keep_alive(time::Duration::from_secs(config.keep_alive_secs.max(5)));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let filter = subscription_filter(&self.prefix);
        let backoff = RetryPolicy::build(2.0, config.reconnect_initial.0)
            .maximum_interval(config.reconnect_max.0)
            .provide();
        let mut failures: u32 = 0;

        info!(host = %config.host, port = config.port, %filter, "connecting to broker");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Sessions are clean, so the subscription is renewed on every connection.
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        error!("failed to subscribe to {}: {}", filter, e);
                        continue;
                    }
                    info!(%filter, "connected to broker");
                    failures = 0;
                    connected.store(true, Ordering::Relaxed);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.route(&publish.topic, &publish.payload).await?;
                }
                Ok(event) => debug!(?event, "broker event"),
                Err(e) => {
                    connected.store(false, Ordering::Relaxed);
                    failures = failures.saturating_add(1);
                    metrics::counter!("mesh_ingest_broker_reconnects_total").increment(1);

                    if config
                        .max_reconnect_attempts
                        .is_some_and(|max| failures >= max)
                    {
                        error!(failures, "giving up on broker: {}", e);
                        return Err(IngestError::BrokerUnavailable {
                            attempts: failures,
                            error: e,
                        });
                    }

                    let delay = backoff.retry_interval(failures - 1, None);
                    warn!(failures, ?delay, "broker connection failed, reconnecting: {}", e);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        connected.store(false, Ordering::Relaxed);
        if client.try_disconnect().is_err() {
            debug!("broker connection already closed");
        }
        info!("broker subscriber stopped");
        Ok(())
    }
}
