//! Lifecycle manager: batched, restartable cascade deletion.
//!
//! Nested deletion is not atomic at scale, so each level is deleted in
//! bounded id batches and every step tolerates rows that are already gone.
//! Re-running a cascade against a partially deleted hierarchy completes
//! cleanly.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use cadence_core::{defaults, EventBus, Result, StoreEvent};

/// Counts of rows removed by a cascade run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub contacts: u64,
    pub reminders: u64,
    pub responses: u64,
    pub feed_events: u64,
}

/// Batched cascade deleter over the account → contacts → {reminders,
/// responses} hierarchy.
#[derive(Clone)]
pub struct CascadeDeleter {
    pool: SqlitePool,
    bus: EventBus,
    batch_size: i64,
}

impl CascadeDeleter {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self {
            pool,
            bus,
            batch_size: defaults::CASCADE_BATCH_SIZE,
        }
    }

    /// Override the batch size (tests exercise multi-batch cascades with
    /// small values).
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Delete a contact and all of its reminders and responses.
    #[instrument(skip(self))]
    pub async fn delete_contact(&self, contact_id: Uuid) -> Result<CascadeStats> {
        let mut stats = CascadeStats::default();

        // Account scope for event emission; a resumed cascade may find the
        // contact row already gone and falls back to what descendants carry.
        let account_id: Option<Uuid> =
            sqlx::query_scalar("SELECT account_id FROM contacts WHERE id = ?1")
                .bind(contact_id)
                .fetch_optional(&self.pool)
                .await?;

        stats.reminders += self
            .drain_children("reminders", "contact_id", contact_id, |id| {
                Some(StoreEvent::ReminderDeleted { reminder_id: id })
            })
            .await?;

        stats.responses += self
            .drain_children("responses", "contact_id", contact_id, |_| None)
            .await?;

        let deleted = sqlx::query("DELETE FROM contacts WHERE id = ?1")
            .bind(contact_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        stats.contacts += deleted;

        if deleted == 1 {
            if let Some(account_id) = account_id {
                self.bus
                    .emit(account_id, StoreEvent::ContactDeleted { contact_id });
            }
        }

        debug!(contact_id = %contact_id, ?stats, "contact cascade complete");
        Ok(stats)
    }

    /// Delete an account's entire hierarchy, including its feed history.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, account_id: Uuid) -> Result<CascadeStats> {
        let mut stats = CascadeStats::default();

        loop {
            let ids: Vec<Uuid> =
                sqlx::query("SELECT id FROM contacts WHERE account_id = ?1 LIMIT ?2")
                    .bind(account_id)
                    .bind(self.batch_size)
                    .fetch_all(&self.pool)
                    .await?
                    .iter()
                    .map(|row| row.get("id"))
                    .collect();

            if ids.is_empty() {
                break;
            }
            for contact_id in ids {
                let child = self.delete_contact(contact_id).await?;
                stats.contacts += child.contacts;
                stats.reminders += child.reminders;
                stats.responses += child.responses;
            }
        }

        // Orphaned responses recorded before the contact resolved, plus the
        // account's feed projection.
        stats.responses += self
            .drain_children("responses", "account_id", account_id, |_| None)
            .await?;
        stats.feed_events += self
            .drain_children("feed_events", "account_id", account_id, |_| None)
            .await?;

        info!(account_id = %account_id, ?stats, "account cascade complete");
        Ok(stats)
    }

    /// Delete all rows of `table` whose `parent_column` equals `parent_id`,
    /// in bounded batches. Idempotent: zero matching rows is success.
    async fn drain_children(
        &self,
        table: &str,
        parent_column: &str,
        parent_id: Uuid,
        emission: impl Fn(Uuid) -> Option<StoreEvent>,
    ) -> Result<u64> {
        let mut total = 0u64;

        loop {
            let rows = sqlx::query(&format!(
                "SELECT id, account_id FROM {table} WHERE {parent_column} = ?1 LIMIT ?2"
            ))
            .bind(parent_id)
            .bind(self.batch_size)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            let batch: Vec<(Uuid, Option<Uuid>)> = rows
                .iter()
                .map(|row| (row.get("id"), row.get("account_id")))
                .collect();

            let placeholders = (0..batch.len())
                .map(|i| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("DELETE FROM {table} WHERE id IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for (id, _) in &batch {
                query = query.bind(*id);
            }
            total += query.execute(&self.pool).await?.rows_affected();

            for (id, account) in &batch {
                if let (Some(account), Some(event)) = (account, emission(*id)) {
                    self.bus.emit(*account, event);
                }
            }
        }

        Ok(total)
    }
}
