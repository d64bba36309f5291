//! Persistence for nodes, events and sightings.
//!
//! The pipeline only ever talks to a `Store`. `MemoryStore` backs tests and deployments without a
//! database, `PgStore` backs everything else.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::event::EventCategory;
use crate::model::{EventRecord, NodeUpdate, Sighting};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Enumeration of errors for operations with a `Store`.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Create the node if unknown and move its `last_seen` forward. Never rewinds.
    async fn upsert_node(&self, update: &NodeUpdate) -> StoreResult<()>;

    async fn append_event(&self, record: &EventRecord) -> StoreResult<()>;

    /// Insert a closed sighting, merging receivers into an existing row for the same
    /// `(public_key, window_start)`, so redelivery is idempotent.
    async fn upsert_advertisement_sighting(&self, sighting: &Sighting) -> StoreResult<()>;

    /// Delete records of `category` received before `cutoff`. Returns the deleted count.
    async fn delete_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete nodes whose non-null `last_seen` is before `cutoff`, together with every record
    /// referencing them. Returns the number of nodes deleted.
    async fn delete_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn count_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Open the store a process is configured with: Postgres when a database URL is set, memory
/// otherwise. Pending migrations are applied to Postgres.
pub async fn connect(database_url: Option<&str>, max_connections: u32) -> StoreResult<Arc<dyn Store>> {
    match database_url.filter(|url| !url.is_empty()) {
        Some(url) => {
            let store = PgStore::new(url, max_connections)?;
            store.migrate().await?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL is not set, using in-memory store: nothing will be persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
