use std::future::Future;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use mesh_common::model::{EventRecord, NodeUpdate, Published, Sighting};
use mesh_common::retry::RetryPolicy;
use mesh_common::store::{Store, StoreResult};
use mesh_worker::relay::WebhookRelay;

use crate::live::LiveHub;

/// Where the deduplicator's units hand off their output. Implementations own every failure:
/// a unit never waits on anything but its own call.
#[async_trait]
pub trait SightingSink: Send + Sync {
    async fn close_sighting(&self, sighting: Sighting);
    async fn persist_event(&self, record: EventRecord);
}

/// Persists closed sightings and events, then fans them out to the webhook relay and to live
/// viewers. Neither fan-out waits on its consumers.
pub struct Distributor {
    store: Arc<dyn Store>,
    persist_retry: RetryPolicy,
    relay: Option<Arc<WebhookRelay>>,
    live: LiveHub,
}

impl Distributor {
    /// `persist_attempts` counts the first attempt, and retries wait a constant `persist_retry`.
    pub fn new(
        store: Arc<dyn Store>,
        persist_attempts: u32,
        persist_retry: time::Duration,
        relay: Option<Arc<WebhookRelay>>,
        live: LiveHub,
    ) -> Self {
        let persist_retry = RetryPolicy::build(1.0, persist_retry)
            .max_retries(persist_attempts.saturating_sub(1))
            .provide();

        Self {
            store,
            persist_retry,
            relay,
            live,
        }
    }

    /// Retry `op` per the persistence policy. Returns false once every attempt failed, after
    /// recording the loss.
    async fn persist<F, Fut>(&self, what: &str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let mut retries = 0;

        loop {
            match op().await {
                Ok(()) => return true,
                Err(e) if self.persist_retry.allows_retry(retries) => {
                    let delay = self.persist_retry.retry_interval(retries, None);
                    warn!(what, retries, ?delay, "failed to persist, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(e) => {
                    metrics::counter!("mesh_ingest_data_loss_total", "what" => what.to_owned())
                        .increment(1);
                    error!(what, attempts = retries + 1, "data loss, giving up on persisting: {}", e);
                    return false;
                }
            }
        }
    }

    async fn store_sighting(&self, sighting: &Sighting) -> StoreResult<()> {
        self.store.upsert_node(&sighting.node_update()).await?;
        for receiver in &sighting.receivers {
            self.store
                .upsert_node(&NodeUpdate::seen(
                    receiver.public_key.clone(),
                    receiver.received_at,
                ))
                .await?;
        }
        self.store.upsert_advertisement_sighting(sighting).await
    }

    async fn store_event(&self, record: &EventRecord) -> StoreResult<()> {
        self.store
            .upsert_node(&NodeUpdate::seen(
                record.receiver.clone(),
                record.received_at,
            ))
            .await?;
        self.store.append_event(record).await
    }

    fn publish(&self, published: Published) {
        if let Some(relay) = &self.relay {
            relay.dispatch(&published);
        }
        self.live.broadcast(&published);
    }
}

#[async_trait]
impl SightingSink for Distributor {
    async fn close_sighting(&self, sighting: Sighting) {
        metrics::counter!("mesh_dedup_sightings_closed_total").increment(1);
        metrics::histogram!("mesh_dedup_receivers_per_sighting")
            .record(sighting.receivers.len() as f64);
        debug!(
            public_key = sighting.public_key.short(),
            receivers = sighting.receivers.len(),
            "sighting closed"
        );

        self.persist("advertisement", || self.store_sighting(&sighting))
            .await;

        // A closed sighting is relayed even when it could not be stored.
        self.publish(Published::Sighting(sighting));
    }

    async fn persist_event(&self, record: EventRecord) {
        if self.persist("event", || self.store_event(&record)).await {
            self.publish(Published::Event(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{DateTime, Utc};
    use serde_json::Map;

    use super::*;
    use mesh_common::event::{EventCategory, PublicKey};
    use mesh_common::model::AdvertisementEvent;
    use mesh_common::store::{MemoryStore, StoreError};

    fn key(byte: char) -> PublicKey {
        byte.to_string().repeat(64).parse().unwrap()
    }

    fn sighting(at: DateTime<Utc>) -> Sighting {
        let mut sighting = Sighting::open(&AdvertisementEvent {
            sender: key('a'),
            name: Some("Hilltop".to_owned()),
            adv_type: None,
            flags: None,
            receiver: key('1'),
            received_at: at,
        });
        sighting.observe(&AdvertisementEvent {
            sender: key('a'),
            name: None,
            adv_type: None,
            flags: None,
            receiver: key('2'),
            received_at: at,
        });
        sighting
    }

    /// A memory store whose first `failures` sighting upserts fail.
    struct FailingStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn upsert_node(&self, update: &NodeUpdate) -> StoreResult<()> {
            self.inner.upsert_node(update).await
        }

        async fn append_event(&self, record: &EventRecord) -> StoreResult<()> {
            self.inner.append_event(record).await
        }

        async fn upsert_advertisement_sighting(&self, sighting: &Sighting) -> StoreResult<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Unavailable("database is down".to_owned()));
            }
            self.inner.upsert_advertisement_sighting(sighting).await
        }

        async fn delete_older_than(
            &self,
            category: EventCategory,
            cutoff: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.delete_older_than(category, cutoff).await
        }

        async fn delete_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.delete_inactive_nodes(cutoff).await
        }

        async fn count_older_than(
            &self,
            category: EventCategory,
            cutoff: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.count_older_than(category, cutoff).await
        }

        async fn count_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
            self.inner.count_inactive_nodes(cutoff).await
        }
    }

    fn failing(failures: u32) -> Arc<FailingStore> {
        Arc::new(FailingStore {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(failures),
        })
    }

    #[tokio::test]
    async fn test_close_touches_sender_and_receivers() {
        let store = Arc::new(MemoryStore::new());
        let live = LiveHub::new(8);
        let (_, mut frames) = live.subscribe();
        let distributor = Distributor::new(
            store.clone(),
            3,
            time::Duration::from_millis(1),
            None,
            live,
        );
        let t = Utc::now();

        distributor.close_sighting(sighting(t)).await;

        let sender = store.node(&key('a')).unwrap();
        assert_eq!(sender.last_seen, Some(t));
        assert_eq!(sender.name.as_deref(), Some("Hilltop"));
        assert!(store.node(&key('1')).is_some());
        assert!(store.node(&key('2')).is_some());
        assert_eq!(store.sightings().len(), 1);
        assert!(frames.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_is_retried() {
        let store = failing(2);
        let distributor = Distributor::new(
            store.clone(),
            3,
            time::Duration::from_millis(200),
            None,
            LiveHub::new(8),
        );

        distributor.close_sighting(sighting(Utc::now())).await;

        assert_eq!(store.inner.sightings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_lose_the_sighting_but_still_publish() {
        let store = failing(3);
        let live = LiveHub::new(8);
        let (_, mut frames) = live.subscribe();
        let distributor = Distributor::new(
            store.clone(),
            3,
            time::Duration::from_millis(200),
            None,
            live,
        );

        distributor.close_sighting(sighting(Utc::now())).await;

        assert!(store.inner.sightings().is_empty());
        assert!(frames.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_event_is_stored_and_published() {
        let store = Arc::new(MemoryStore::new());
        let live = LiveHub::new(8);
        let (_, mut frames) = live.subscribe();
        let distributor = Distributor::new(
            store.clone(),
            3,
            time::Duration::from_millis(1),
            None,
            live,
        );
        let t = Utc::now();

        distributor
            .persist_event(EventRecord {
                category: EventCategory::Telemetry,
                event_name: "telemetry_response".to_owned(),
                receiver: key('1'),
                payload: Map::new(),
                received_at: t,
            })
            .await;

        assert_eq!(store.events().len(), 1);
        assert_eq!(store.node(&key('1')).and_then(|n| n.last_seen), Some(t));
        let frame: serde_json::Value = serde_json::from_str(&frames.try_recv().unwrap()).unwrap();
        assert_eq!(frame["event_name"], "telemetry_response");
    }
}
