use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{Store, StoreError, StoreResult};
use crate::event::EventCategory;
use crate::model::{EventRecord, NodeUpdate, Sighting};

/// A `Store` backed by the PostgreSQL tables in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn query_error(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |error| StoreError::QueryError {
        command: command.to_owned(),
        error,
    }
}

impl PgStore {
    /// Connect a new pool. The pool connects lazily, so an unreachable database surfaces on
    /// first use rather than here.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::MigrationError { error })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_node(&self, update: &NodeUpdate) -> StoreResult<()> {
        // Declared fields only overwrite when this update is at least as new as the stored one.
        let query = r#"
INSERT INTO nodes
    (public_key, name, adv_type, flags, first_seen, last_seen)
VALUES
    ($1, $2, $3, $4, $5, $5)
ON CONFLICT (public_key) DO UPDATE SET
    first_seen = LEAST(nodes.first_seen, EXCLUDED.first_seen),
    last_seen = GREATEST(nodes.last_seen, EXCLUDED.last_seen),
    name = CASE WHEN nodes.last_seen IS NULL OR EXCLUDED.last_seen >= nodes.last_seen
        THEN COALESCE(EXCLUDED.name, nodes.name) ELSE nodes.name END,
    adv_type = CASE WHEN nodes.last_seen IS NULL OR EXCLUDED.last_seen >= nodes.last_seen
        THEN COALESCE(EXCLUDED.adv_type, nodes.adv_type) ELSE nodes.adv_type END,
    flags = CASE WHEN nodes.last_seen IS NULL OR EXCLUDED.last_seen >= nodes.last_seen
        THEN COALESCE(EXCLUDED.flags, nodes.flags) ELSE nodes.flags END
        "#;

        sqlx::query(query)
            .bind(update.public_key.as_str())
            .bind(update.name.as_deref())
            .bind(update.adv_type.as_deref())
            .bind(update.flags.map(i64::from))
            .bind(update.seen_at)
            .execute(&self.pool)
            .await
            .map_err(query_error("UPSERT nodes"))?;

        Ok(())
    }

    async fn append_event(&self, record: &EventRecord) -> StoreResult<()> {
        // Make sure the receiving gateway exists without moving its last_seen.
        sqlx::query(
            r#"
INSERT INTO nodes (public_key, first_seen, last_seen)
VALUES ($1, $2, $2)
ON CONFLICT (public_key) DO NOTHING
            "#,
        )
        .bind(record.receiver.as_str())
        .bind(record.received_at)
        .execute(&self.pool)
        .await
        .map_err(query_error("INSERT nodes"))?;

        sqlx::query(
            r#"
INSERT INTO events
    (category, event_name, receiver_public_key, payload, received_at)
VALUES
    ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.category.as_str())
        .bind(&record.event_name)
        .bind(record.receiver.as_str())
        .bind(sqlx::types::Json(&record.payload))
        .bind(record.received_at)
        .execute(&self.pool)
        .await
        .map_err(query_error("INSERT events"))?;

        Ok(())
    }

    async fn upsert_advertisement_sighting(&self, sighting: &Sighting) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_error("BEGIN"))?;

        let advertisement_id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO advertisements
    (public_key, name, adv_type, flags, window_start)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT (public_key, window_start) DO UPDATE SET
    name = COALESCE(advertisements.name, EXCLUDED.name),
    adv_type = COALESCE(advertisements.adv_type, EXCLUDED.adv_type),
    flags = COALESCE(advertisements.flags, EXCLUDED.flags)
RETURNING id
            "#,
        )
        .bind(sighting.public_key.as_str())
        .bind(sighting.name.as_deref())
        .bind(sighting.adv_type.as_deref())
        .bind(sighting.flags.map(i64::from))
        .bind(sighting.window_start)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error("UPSERT advertisements"))?;

        for receiver in &sighting.receivers {
            sqlx::query(
                r#"
INSERT INTO advertisement_receivers
    (advertisement_id, receiver_public_key, received_at)
VALUES
    ($1, $2, $3)
ON CONFLICT (advertisement_id, receiver_public_key) DO NOTHING
                "#,
            )
            .bind(advertisement_id)
            .bind(receiver.public_key.as_str())
            .bind(receiver.received_at)
            .execute(&mut *tx)
            .await
            .map_err(query_error("INSERT advertisement_receivers"))?;
        }

        tx.commit().await.map_err(query_error("COMMIT"))?;

        Ok(())
    }

    async fn delete_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = if category == EventCategory::Advertisement {
            sqlx::query("DELETE FROM advertisements WHERE window_start < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(query_error("DELETE advertisements"))?
        } else {
            sqlx::query("DELETE FROM events WHERE category = $1 AND received_at < $2")
                .bind(category.as_str())
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(query_error("DELETE events"))?
        };

        Ok(result.rows_affected())
    }

    async fn delete_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        // Foreign keys cascade to events, advertisements and their receivers.
        let result = sqlx::query("DELETE FROM nodes WHERE last_seen IS NOT NULL AND last_seen < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(query_error("DELETE nodes"))?;

        Ok(result.rows_affected())
    }

    async fn count_older_than(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let count: i64 = if category == EventCategory::Advertisement {
            sqlx::query_scalar("SELECT COUNT(*) FROM advertisements WHERE window_start < $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(query_error("COUNT advertisements"))?
        } else {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM events WHERE category = $1 AND received_at < $2",
            )
            .bind(category.as_str())
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await
            .map_err(query_error("COUNT events"))?
        };

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn count_inactive_nodes(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes WHERE last_seen IS NOT NULL AND last_seen < $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error("COUNT nodes"))?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}
