//! Test fixtures shared by this crate's integration tests and downstream
//! crates' suites.
//!
//! Each [`TestDatabase`] is an independent in-memory SQLite database with the
//! schema applied, so parallel tests never see each other's data.
//!
//! ## Usage
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn my_test() {
//!     let test_db = TestDatabase::new().await;
//!     let contact = test_db.enroll_confirmed_contact("+15551234567").await;
//!     // ...
//! }
//! ```

use chrono::NaiveTime;
use uuid::Uuid;

use crate::Database;
use cadence_core::{
    Contact, ContactRepository, ContactStatus, CreateReminderRequest, EnrollContactRequest,
    RecurrenceRule, Reminder, ReminderRepository, ResponseRequirement,
};

/// In-memory test database with the full repository context.
pub struct TestDatabase {
    pub db: Database,
    /// Account every fixture entity belongs to.
    pub account_id: Uuid,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory test database");
        Self {
            db,
            account_id: Uuid::new_v4(),
        }
    }

    /// Enroll a contact in the fixture account (status `pending`).
    pub async fn enroll_contact(&self, phone: &str, name: &str) -> Contact {
        self.db
            .contacts
            .upsert(EnrollContactRequest {
                account_id: self.account_id,
                phone: phone.to_string(),
                display_name: name.to_string(),
            })
            .await
            .expect("Failed to enroll test contact")
    }

    /// Enroll a contact and mark it confirmed.
    pub async fn enroll_confirmed_contact(&self, phone: &str) -> Contact {
        let contact = self.enroll_contact(phone, "Test Contact").await;
        self.db
            .contacts
            .set_status(contact.id, ContactStatus::Confirmed)
            .await
            .expect("Failed to confirm test contact")
    }

    /// Create a daily 09:00 UTC reminder for a contact.
    pub async fn create_daily_reminder(&self, contact_id: Uuid, title: &str) -> Reminder {
        self.db
            .reminders
            .create(CreateReminderRequest {
                contact_id,
                title: title.to_string(),
                rule: RecurrenceRule::Daily,
                time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                timezone: chrono_tz::UTC,
                requirement: ResponseRequirement::Either,
            })
            .await
            .expect("Failed to create test reminder")
    }

    /// Force a reminder's `next_due` into the past so it is immediately
    /// claimable, bypassing the recurrence engine. Test-only backdoor.
    pub async fn backdate_next_due(&self, reminder_id: Uuid, next_due: chrono::DateTime<chrono::Utc>) {
        sqlx::query("UPDATE reminders SET next_due = ?1 WHERE id = ?2")
            .bind(next_due)
            .bind(reminder_id)
            .execute(&self.db.pool)
            .await
            .expect("Failed to backdate reminder");
    }
}
