//! Contact repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use cadence_core::{
    phone, Contact, ContactRepository, ContactStatus, EnrollContactRequest, Error, EventBus,
    Result, StoreEvent,
};

/// SQLite implementation of ContactRepository.
#[derive(Clone)]
pub struct SqliteContactRepository {
    pool: SqlitePool,
    bus: EventBus,
}

impl SqliteContactRepository {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    fn parse_row(row: &SqliteRow) -> Result<Contact> {
        let status: String = row.try_get("status")?;
        Ok(Contact {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            phone: row.try_get("phone")?,
            display_name: row.try_get("display_name")?,
            status: ContactStatus::parse(&status)
                .ok_or_else(|| Error::Serialization(format!("unknown contact status: {status}")))?,
            created_at: row.try_get("created_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
            rev: row.try_get("rev")?,
        })
    }

    /// Every decodable contact in an account, for sync snapshots. A row that
    /// fails to decode is skipped with a diagnostic rather than failing the
    /// whole snapshot.
    pub async fn snapshot_for_account(&self, account_id: Uuid) -> Result<Vec<Contact>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 ORDER BY created_at"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut contacts = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_row(row) {
                Ok(contact) => contacts.push(contact),
                Err(e) => {
                    let id: Option<Uuid> = row.try_get("id").ok();
                    tracing::warn!(contact_id = ?id, error = %e, "Skipping undecodable contact row");
                }
            }
        }
        Ok(contacts)
    }
}

const CONTACT_COLUMNS: &str =
    "id, account_id, phone, display_name, status, created_at, confirmed_at, rev";

#[async_trait]
impl ContactRepository for SqliteContactRepository {
    async fn upsert(&self, req: EnrollContactRequest) -> Result<Contact> {
        let canonical = phone::canonicalize(&req.phone)?;
        let id = phone::contact_id(req.account_id, &canonical);
        let now = Utc::now();

        // Deterministic id means re-enrolling the same number lands on the
        // existing row; confirmation state is preserved across re-enrolls.
        sqlx::query(
            "INSERT INTO contacts (id, account_id, phone, display_name, status, created_at, rev)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 1)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 rev = contacts.rev + 1",
        )
        .bind(id)
        .bind(req.account_id)
        .bind(&canonical)
        .bind(&req.display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let contact = self.fetch(id).await?;
        self.bus.emit(
            contact.account_id,
            StoreEvent::ContactUpserted {
                contact: contact.clone(),
            },
        );
        Ok(contact)
    }

    async fn fetch(&self, id: Uuid) -> Result<Contact> {
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ContactNotFound(id))?;

        Self::parse_row(&row)
    }

    async fn find_by_phone(&self, canonical_phone: &str) -> Result<Option<Contact>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ?1 LIMIT 1"
        ))
        .bind(canonical_phone)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn list_for_account(&self, account_id: Uuid) -> Result<Vec<Contact>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 ORDER BY created_at"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn set_status(&self, id: Uuid, status: ContactStatus) -> Result<Contact> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE contacts
             SET status = ?1,
                 confirmed_at = CASE WHEN ?1 = 'confirmed' THEN ?2 ELSE confirmed_at END,
                 rev = rev + 1
             WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ContactNotFound(id));
        }

        let contact = self.fetch(id).await?;
        self.bus.emit(
            contact.account_id,
            StoreEvent::ContactStatusChanged {
                contact: contact.clone(),
            },
        );
        Ok(contact)
    }
}
