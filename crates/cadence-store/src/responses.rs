//! Response repository implementation (inbound reply audit trail).

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use cadence_core::{
    new_v7, Error, EventBus, NewResponse, RecordedResponse, Response, ResponseOutcome,
    ResponseRepository, Result, StoreEvent,
};

/// SQLite implementation of ResponseRepository.
#[derive(Clone)]
pub struct SqliteResponseRepository {
    pool: SqlitePool,
    bus: EventBus,
}

const RESPONSE_COLUMNS: &str = "id, account_id, contact_id, reminder_id, body, media_urls, \
     gateway_message_id, received_at, outcome";

impl SqliteResponseRepository {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    fn parse_row(row: &SqliteRow) -> Result<Response> {
        let media_json: String = row.try_get("media_urls")?;
        let media_urls: Vec<String> = serde_json::from_str(&media_json)
            .map_err(|e| Error::Serialization(format!("bad media list: {e}")))?;
        let outcome: String = row.try_get("outcome")?;

        Ok(Response {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            contact_id: row.try_get("contact_id")?,
            reminder_id: row.try_get("reminder_id")?,
            body: row.try_get("body")?,
            media_urls,
            gateway_message_id: row.try_get("gateway_message_id")?,
            received_at: row.try_get("received_at")?,
            outcome: ResponseOutcome::parse(&outcome)
                .ok_or_else(|| Error::Serialization(format!("unknown outcome: {outcome}")))?,
        })
    }
}

#[async_trait]
impl ResponseRepository for SqliteResponseRepository {
    async fn record(&self, response: NewResponse) -> Result<RecordedResponse> {
        let id = new_v7();
        let media_json = serde_json::to_string(&response.media_urls)?;

        // The unique gateway_message_id column is the idempotency barrier:
        // a redelivered webhook inserts nothing and returns the prior row.
        let result = sqlx::query(
            "INSERT INTO responses (id, account_id, contact_id, reminder_id, body, media_urls, \
                 gateway_message_id, received_at, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(gateway_message_id) DO NOTHING",
        )
        .bind(id)
        .bind(response.account_id)
        .bind(response.contact_id)
        .bind(response.reminder_id)
        .bind(&response.body)
        .bind(&media_json)
        .bind(&response.gateway_message_id)
        .bind(response.received_at)
        .bind(response.outcome.as_str())
        .execute(&self.pool)
        .await?;

        let stored = self
            .find_by_gateway_id(&response.gateway_message_id)
            .await?
            .ok_or_else(|| Error::Internal("response vanished after insert".into()))?;

        if result.rows_affected() == 1 {
            if let Some(account_id) = stored.account_id {
                self.bus.emit(
                    account_id,
                    StoreEvent::ResponseRecorded {
                        response: stored.clone(),
                    },
                );
            }
            Ok(RecordedResponse::Inserted(stored))
        } else {
            Ok(RecordedResponse::AlreadyProcessed(stored))
        }
    }

    async fn find_by_gateway_id(&self, gateway_message_id: &str) -> Result<Option<Response>> {
        let row = sqlx::query(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE gateway_message_id = ?1"
        ))
        .bind(gateway_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_for_contact(&self, contact_id: Uuid, limit: i64) -> Result<Vec<Response>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses
             WHERE contact_id = ?1
             ORDER BY received_at DESC
             LIMIT ?2"
        ))
        .bind(contact_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }
}
