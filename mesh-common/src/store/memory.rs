use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Store, StoreError, StoreResult};
use crate::event::{EventCategory, PublicKey};
use crate::model::{EventRecord, NodeIdentity, NodeUpdate, Sighting};

#[derive(Default)]
struct Tables {
    nodes: HashMap<PublicKey, NodeIdentity>,
    events: Vec<EventRecord>,
    sightings: HashMap<(PublicKey, DateTime<Utc>), Sighting>,
}

/// A `Store` that keeps everything in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_owned()))
    }

    /// Register a node known only out-of-band, with no `last_seen`.
    pub fn tag_node(&self, public_key: PublicKey) -> StoreResult<()> {
        let mut tables = self.tables()?;
        tables
            .nodes
            .entry(public_key.clone())
            .or_insert_with(|| NodeIdentity::tagged(public_key));
        Ok(())
    }

    /// Insert a record as is, bypassing the node bookkeeping of `append_event`.
    pub fn insert_event(&self, record: EventRecord) -> StoreResult<()> {
        self.tables()?.events.push(record);
        Ok(())
    }

    pub fn node(&self, public_key: &PublicKey) -> Option<NodeIdentity> {
        self.tables().ok()?.nodes.get(public_key).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeIdentity> {
        self.tables()
            .map(|tables| tables.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.tables()
            .map(|tables| tables.events.clone())
            .unwrap_or_default()
    }

    /// Stored sightings ordered by window start.
    pub fn sightings(&self) -> Vec<Sighting> {
        let mut sightings: Vec<Sighting> = self
            .tables()
            .map(|tables| tables.sightings.values().cloned().collect())
            .unwrap_or_default();
        sightings.sort_by_key(|s| s.window_start);
        sightings
    }
}

fn touch(tables: &mut Tables, update: &NodeUpdate) {
    tables
        .nodes
        .entry(update.public_key.clone())
        .or_insert_with(|| NodeIdentity::tagged(update.public_key.clone()))
        .touch(update);
}

fn is_inactive(node: &NodeIdentity, cutoff: DateTime<Utc>) -> bool {
    node.last_seen.is_some_and(|last_seen| last_seen < cutoff)
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_node(&self, update: &NodeUpdate) -> StoreResult<()> {
        let mut tables = self.tables()?;
        touch(&mut tables, update);
        Ok(())
    }

    async fn append_event(&self, record: &EventRecord) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if !tables.nodes.contains_key(&record.receiver) {
            touch(
                &mut tables,
                &NodeUpdate::seen(record.receiver.clone(), record.received_at),
            );
        }
        tables.events.push(record.clone());
        Ok(())
    }

    async fn upsert_advertisement_sighting(&self, sighting: &Sighting) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let key = (sighting.public_key.clone(), sighting.window_start);

        match tables.sightings.get_mut(&key) {
            Some(existing) => {
                for receiver in &sighting.receivers {
                    if !existing.has_receiver(&receiver.public_key) {
                        existing.receivers.push(receiver.clone());
                    }
                }
            }
            None => {
                tables.sightings.insert(key, sighting.clone());
            }
        }
        Ok(())
    }

    async fn delete_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tables = self.tables()?;

        if category == EventCategory::Advertisement {
            let before = tables.sightings.len();
            tables.sightings.retain(|_, s| s.window_start >= cutoff);
            return Ok((before - tables.sightings.len()) as u64);
        }

        let before = tables.events.len();
        tables
            .events
            .retain(|e| e.category != category || e.received_at >= cutoff);
        Ok((before - tables.events.len()) as u64)
    }

    async fn delete_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables()?;

        let removed: HashSet<PublicKey> = tables
            .nodes
            .values()
            .filter(|node| is_inactive(node, cutoff))
            .map(|node| node.public_key.clone())
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        let Tables {
            nodes,
            events,
            sightings,
        } = &mut *tables;
        nodes.retain(|public_key, _| !removed.contains(public_key));
        events.retain(|e| !removed.contains(&e.receiver));
        sightings.retain(|(public_key, _), _| !removed.contains(public_key));
        for sighting in sightings.values_mut() {
            sighting
                .receivers
                .retain(|r| !removed.contains(&r.public_key));
        }
        let deleted = removed.len() as u64;

        Ok(deleted)
    }

    async fn count_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let tables = self.tables()?;

        let count = if category == EventCategory::Advertisement {
            tables
                .sightings
                .values()
                .filter(|s| s.window_start < cutoff)
                .count()
        } else {
            tables
                .events
                .iter()
                .filter(|e| e.category == category && e.received_at < cutoff)
                .count()
        };
        Ok(count as u64)
    }

    async fn count_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let tables = self.tables()?;
        let count = tables
            .nodes
            .values()
            .filter(|node| is_inactive(node, cutoff))
            .count();
        Ok(count as u64)
    }
}
