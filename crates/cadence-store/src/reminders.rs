//! Reminder repository implementation, including the dispatch claim CAS.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use cadence_core::{
    defaults, new_v7, next_occurrence, recurrence, CreateReminderRequest, Error, EventBus,
    Occurrence, RecurrenceRule, Reminder, ReminderRepository, ReminderStatus, ResponseRequirement,
    Result, StoreEvent, UpdateReminderRequest,
};

/// SQLite implementation of ReminderRepository.
#[derive(Clone)]
pub struct SqliteReminderRepository {
    pool: SqlitePool,
    bus: EventBus,
}

const REMINDER_COLUMNS: &str = "id, contact_id, account_id, title, rule, time_of_day, timezone, \
     requirement, status, next_due, send_count, completion_count, last_dispatched_at, \
     last_completed_at, last_send_failed, created_at, rev";

impl SqliteReminderRepository {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    fn parse_row(row: &SqliteRow) -> Result<Reminder> {
        let rule_json: String = row.try_get("rule")?;
        let rule: RecurrenceRule = serde_json::from_str(&rule_json)
            .map_err(|e| Error::Serialization(format!("bad recurrence rule: {e}")))?;

        let tz_name: String = row.try_get("timezone")?;
        let timezone = tz_name
            .parse()
            .map_err(|_| Error::Serialization(format!("unknown timezone: {tz_name}")))?;

        let requirement: String = row.try_get("requirement")?;
        let status: String = row.try_get("status")?;

        Ok(Reminder {
            id: row.try_get("id")?,
            contact_id: row.try_get("contact_id")?,
            account_id: row.try_get("account_id")?,
            title: row.try_get("title")?,
            rule,
            time_of_day: row.try_get("time_of_day")?,
            timezone,
            requirement: ResponseRequirement::parse(&requirement).ok_or_else(|| {
                Error::Serialization(format!("unknown requirement: {requirement}"))
            })?,
            status: ReminderStatus::parse(&status)
                .ok_or_else(|| Error::Serialization(format!("unknown status: {status}")))?,
            next_due: row.try_get("next_due")?,
            send_count: row.try_get("send_count")?,
            completion_count: row.try_get("completion_count")?,
            last_dispatched_at: row.try_get("last_dispatched_at")?,
            last_completed_at: row.try_get("last_completed_at")?,
            last_send_failed: row.try_get::<i64, _>("last_send_failed")? != 0,
            created_at: row.try_get("created_at")?,
            rev: row.try_get("rev")?,
        })
    }

    /// Every decodable reminder in an account, for sync snapshots. A row
    /// with an undecodable rule or timezone is skipped with a diagnostic.
    pub async fn snapshot_for_account(&self, account_id: Uuid) -> Result<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE account_id = ?1 ORDER BY created_at"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut reminders = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_row(row) {
                Ok(reminder) => reminders.push(reminder),
                Err(e) => {
                    let id: Option<Uuid> = row.try_get("id").ok();
                    tracing::warn!(reminder_id = ?id, error = %e, "Skipping undecodable reminder row");
                }
            }
        }
        Ok(reminders)
    }

    async fn fetch_and_emit_updated(&self, id: Uuid) -> Result<Reminder> {
        let reminder = self.fetch(id).await?;
        self.bus.emit(
            reminder.account_id,
            StoreEvent::ReminderUpdated {
                reminder: reminder.clone(),
            },
        );
        Ok(reminder)
    }
}

#[async_trait]
impl ReminderRepository for SqliteReminderRepository {
    async fn create(&self, req: CreateReminderRequest) -> Result<Reminder> {
        recurrence::validate_rule(&req.rule)?;
        let now = Utc::now();

        // Every active reminder carries exactly one future next_due; a
        // one-time instant already in the past is a configuration error.
        let next_due = match next_occurrence(&req.rule, req.time_of_day, req.timezone, now)? {
            Occurrence::At(at) => at,
            Occurrence::Exhausted => {
                return Err(Error::InvalidInput(
                    "one-time reminder is already in the past".into(),
                ))
            }
        };

        let account_id: Uuid = sqlx::query_scalar("SELECT account_id FROM contacts WHERE id = ?1")
            .bind(req.contact_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::ContactNotFound(req.contact_id))?;

        let id = new_v7();
        let rule_json = serde_json::to_string(&req.rule)?;

        sqlx::query(
            "INSERT INTO reminders (id, contact_id, account_id, title, rule, time_of_day, \
                 timezone, requirement, status, next_due, created_at, rev)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, 1)",
        )
        .bind(id)
        .bind(req.contact_id)
        .bind(account_id)
        .bind(&req.title)
        .bind(&rule_json)
        .bind(req.time_of_day)
        .bind(req.timezone.name())
        .bind(req.requirement.as_str())
        .bind(next_due)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let reminder = self.fetch(id).await?;
        self.bus.emit(
            reminder.account_id,
            StoreEvent::ReminderCreated {
                reminder: reminder.clone(),
            },
        );
        Ok(reminder)
    }

    async fn fetch(&self, id: Uuid) -> Result<Reminder> {
        let row = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::ReminderNotFound(id))?;

        Self::parse_row(&row)
    }

    async fn update(&self, id: Uuid, req: UpdateReminderRequest) -> Result<Reminder> {
        let current = self.fetch(id).await?;

        let rule = req.rule.unwrap_or(current.rule);
        recurrence::validate_rule(&rule)?;
        let time_of_day = req.time_of_day.unwrap_or(current.time_of_day);
        let timezone = req.timezone.unwrap_or(current.timezone);
        let status = req.status.unwrap_or(current.status);
        let title = req.title.unwrap_or(current.title);
        let requirement = req.requirement.unwrap_or(current.requirement);

        // Any schedule-relevant edit (or a resume) recomputes next_due; the
        // dispatcher's claim CAS observes the change and drops stale claims.
        let next_due = if status == ReminderStatus::Active {
            match next_occurrence(&rule, time_of_day, timezone, Utc::now())? {
                Occurrence::At(at) => Some(at),
                Occurrence::Exhausted => {
                    return Err(Error::InvalidInput(
                        "one-time reminder is already in the past".into(),
                    ))
                }
            }
        } else {
            None
        };

        let rule_json = serde_json::to_string(&rule)?;
        sqlx::query(
            "UPDATE reminders
             SET title = ?1, rule = ?2, time_of_day = ?3, timezone = ?4, requirement = ?5,
                 status = ?6, next_due = ?7, rev = rev + 1
             WHERE id = ?8",
        )
        .bind(&title)
        .bind(&rule_json)
        .bind(time_of_day)
        .bind(timezone.name())
        .bind(requirement.as_str())
        .bind(status.as_str())
        .bind(next_due)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.fetch_and_emit_updated(id).await
    }

    async fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE contact_id = ?1 ORDER BY created_at"
        ))
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn list_due(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reminder>> {
        let rows = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE status = 'active' AND next_due IS NOT NULL
               AND next_due >= ?1 AND next_due <= ?2
             ORDER BY next_due"
        ))
        .bind(window_start)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_row).collect()
    }

    async fn claim(
        &self,
        id: Uuid,
        observed_next_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let stale_before = now - Duration::seconds(defaults::CLAIM_STALE_SECS as i64);

        // Compare-and-swap on the observed next_due. A lost claim means a
        // concurrent tick already took (or advanced) this reminder. Claims
        // older than the staleness bound are treated as abandoned.
        let result = sqlx::query(
            "UPDATE reminders
             SET in_flight = 1, claimed_at = ?1, rev = rev + 1
             WHERE id = ?2 AND status = 'active' AND next_due = ?3
               AND (in_flight = 0 OR claimed_at <= ?4)",
        )
        .bind(now)
        .bind(id)
        .bind(observed_next_due)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        next_due: Option<DateTime<Utc>>,
        dispatched_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE reminders
             SET next_due = ?1,
                 status = CASE WHEN ?1 IS NULL THEN 'completed' ELSE status END,
                 send_count = send_count + 1,
                 last_dispatched_at = ?2,
                 last_send_failed = 0,
                 in_flight = 0, claimed_at = NULL,
                 rev = rev + 1
             WHERE id = ?3 AND status = 'active'",
        )
        .bind(next_due)
        .bind(dispatched_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Paused or archived mid-flight. The send already happened; just
            // release the claim without advancing the schedule.
            tracing::debug!(reminder_id = %id, "status changed mid-send; releasing claim only");
            sqlx::query(
                "UPDATE reminders
                 SET in_flight = 0, claimed_at = NULL, rev = rev + 1
                 WHERE id = ?1",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        self.fetch_and_emit_updated(id).await?;
        Ok(())
    }

    async fn mark_send_failed(&self, id: Uuid) -> Result<()> {
        // next_due is left untouched so the next poll retries the occurrence.
        sqlx::query(
            "UPDATE reminders
             SET last_send_failed = 1, in_flight = 0, claimed_at = NULL, rev = rev + 1
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.fetch_and_emit_updated(id).await?;
        Ok(())
    }

    async fn complete_occurrence(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        // First writer wins: the conditional only passes while the latest
        // dispatched occurrence has no completion yet.
        let result = sqlx::query(
            "UPDATE reminders
             SET completion_count = completion_count + 1, last_completed_at = ?1, rev = rev + 1
             WHERE id = ?2 AND last_dispatched_at IS NOT NULL
               AND (last_completed_at IS NULL OR last_completed_at < last_dispatched_at)",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let won = result.rows_affected() == 1;
        if won {
            self.fetch_and_emit_updated(id).await?;
        }
        Ok(won)
    }

    async fn latest_open_for_contact(
        &self,
        contact_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Reminder>> {
        let row = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE contact_id = ?1 AND status != 'archived'
               AND last_dispatched_at IS NOT NULL AND last_dispatched_at >= ?2
               AND (last_completed_at IS NULL OR last_completed_at < last_dispatched_at)
             ORDER BY last_dispatched_at DESC
             LIMIT 1"
        ))
        .bind(contact_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn latest_dispatched_for_contact(
        &self,
        contact_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Reminder>> {
        let row = sqlx::query(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders
             WHERE contact_id = ?1 AND status != 'archived'
               AND last_dispatched_at IS NOT NULL AND last_dispatched_at >= ?2
             ORDER BY last_dispatched_at DESC
             LIMIT 1"
        ))
        .bind(contact_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }
}
