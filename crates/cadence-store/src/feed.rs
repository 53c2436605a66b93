//! Feed event repository: the deduplicated, client-facing projection.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use cadence_core::{
    new_v7, Error, EventBus, FeedEvent, FeedEventKind, FeedEventRepository, NewFeedEvent, Result,
    StoreEvent,
};

/// SQLite implementation of FeedEventRepository.
#[derive(Clone)]
pub struct SqliteFeedEventRepository {
    pool: SqlitePool,
    bus: EventBus,
}

const FEED_COLUMNS: &str = "seq, id, account_id, kind, source_id, title, occurred_at";

impl SqliteFeedEventRepository {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    fn parse_row(row: &SqliteRow) -> Result<FeedEvent> {
        let kind: String = row.try_get("kind")?;
        Ok(FeedEvent {
            seq: row.try_get("seq")?,
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            kind: FeedEventKind::parse(&kind)
                .ok_or_else(|| Error::Serialization(format!("unknown feed kind: {kind}")))?,
            source_id: row.try_get("source_id")?,
            title: row.try_get("title")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

#[async_trait]
impl FeedEventRepository for SqliteFeedEventRepository {
    async fn append(&self, event: NewFeedEvent) -> Result<Option<FeedEvent>> {
        let id = new_v7();

        // The (account, dedup_key) marker is durable: replays of the same
        // underlying write insert nothing and emit nothing.
        let row = sqlx::query(&format!(
            "INSERT INTO feed_events (id, account_id, kind, source_id, title, occurred_at, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id, dedup_key) DO NOTHING
             RETURNING {FEED_COLUMNS}"
        ))
        .bind(id)
        .bind(event.account_id)
        .bind(event.kind.as_str())
        .bind(event.source_id)
        .bind(&event.title)
        .bind(event.occurred_at)
        .bind(&event.dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let feed_event = Self::parse_row(&row)?;
                self.bus.emit(
                    feed_event.account_id,
                    StoreEvent::FeedEventAppended {
                        event: feed_event.clone(),
                    },
                );
                Ok(Some(feed_event))
            }
            None => {
                tracing::debug!(
                    account_id = %event.account_id,
                    dedup_key = %event.dedup_key,
                    "feed event already emitted; dropping replay"
                );
                Ok(None)
            }
        }
    }

    async fn list_for_account(
        &self,
        account_id: Uuid,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<FeedEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {FEED_COLUMNS} FROM feed_events
             WHERE account_id = ?1 AND seq > ?2
             ORDER BY seq
             LIMIT ?3"
        ))
        .bind(account_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }
}
