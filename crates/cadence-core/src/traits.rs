//! Core repository traits for the reminder store.
//!
//! These traits define the hierarchical store interface every component goes
//! through — there are no ad hoc queries bypassing it. Concrete
//! implementations live in `cadence-store`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

/// Repository for enrolled contacts.
#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Enroll a contact, or update the existing record when the same number
    /// is re-enrolled within the account. Fresh enrollments start `pending`.
    async fn upsert(&self, req: EnrollContactRequest) -> Result<Contact>;

    /// Fetch a contact by id.
    async fn fetch(&self, id: Uuid) -> Result<Contact>;

    /// Resolve a contact by canonical phone number, across accounts.
    async fn find_by_phone(&self, canonical_phone: &str) -> Result<Option<Contact>>;

    /// List all contacts belonging to an account.
    async fn list_for_account(&self, account_id: Uuid) -> Result<Vec<Contact>>;

    /// Transition a contact's confirmation state.
    async fn set_status(&self, id: Uuid, status: ContactStatus) -> Result<Contact>;
}

/// Repository for reminders, including the dispatcher's claim primitives.
#[async_trait]
pub trait ReminderRepository: Send + Sync {
    /// Create a reminder. The rule is validated and the initial `next_due`
    /// computed here, so configuration errors never reach the dispatcher.
    async fn create(&self, req: CreateReminderRequest) -> Result<Reminder>;

    /// Fetch a reminder by id.
    async fn fetch(&self, id: Uuid) -> Result<Reminder>;

    /// Apply presentation-layer edits. Schedule-owned fields are untouchable;
    /// a rule/time/zone change recomputes `next_due`.
    async fn update(&self, id: Uuid, req: UpdateReminderRequest) -> Result<Reminder>;

    /// List reminders for a contact.
    async fn list_for_contact(&self, contact_id: Uuid) -> Result<Vec<Reminder>>;

    /// Active reminders with `next_due` inside `[window_start, now]`.
    async fn list_due(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reminder>>;

    /// Atomically claim a due reminder for dispatch.
    ///
    /// Succeeds only if `next_due` still equals `observed_next_due`, the
    /// reminder is still active, and no other claim is in flight. Returns
    /// false when another concurrent invocation won — callers skip silently.
    async fn claim(
        &self,
        id: Uuid,
        observed_next_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// After a successful delivery: advance `next_due`, bump the send
    /// counter, release the claim, clear any failed-send flag. `None`
    /// transitions a one-time reminder to completed.
    ///
    /// The advance applies only while the reminder is still active, so a
    /// pause/archive observed mid-send stops further scheduling.
    async fn reschedule(
        &self,
        id: Uuid,
        next_due: Option<DateTime<Utc>>,
        dispatched_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Delivery retries exhausted: release the claim and surface
    /// `last_send_failed` without consuming a schedule advance.
    async fn mark_send_failed(&self, id: Uuid) -> Result<()>;

    /// Record an occurrence completion. First writer wins: returns false if
    /// the latest dispatched occurrence is already completed.
    async fn complete_occurrence(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// The most recently dispatched reminder for a contact whose occurrence
    /// is still open (dispatched after `since`, not yet completed).
    async fn latest_open_for_contact(
        &self,
        contact_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Reminder>>;

    /// The most recently dispatched reminder for a contact after `since`,
    /// completed or not. Lets the correlator tell a second reply to an
    /// already-completed occurrence apart from a reply that matches nothing.
    async fn latest_dispatched_for_contact(
        &self,
        contact_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Reminder>>;
}

/// Repository for inbound responses (audit trail).
#[async_trait]
pub trait ResponseRepository: Send + Sync {
    /// Record a response, deduplicated on `gateway_message_id`. Returns the
    /// previously recorded row when the gateway redelivers.
    async fn record(&self, response: NewResponse) -> Result<RecordedResponse>;

    /// Look up a response by the gateway's message id.
    async fn find_by_gateway_id(&self, gateway_message_id: &str) -> Result<Option<Response>>;

    /// List responses for a contact, newest first.
    async fn list_for_contact(&self, contact_id: Uuid, limit: i64) -> Result<Vec<Response>>;
}

/// Outcome of recording a response.
#[derive(Debug, Clone)]
pub enum RecordedResponse {
    /// Fresh row inserted.
    Inserted(Response),
    /// The gateway message id was already processed; prior row returned.
    AlreadyProcessed(Response),
}

impl RecordedResponse {
    pub fn response(&self) -> &Response {
        match self {
            RecordedResponse::Inserted(r) | RecordedResponse::AlreadyProcessed(r) => r,
        }
    }
}

/// Repository for the deduplicated feed event projection.
#[async_trait]
pub trait FeedEventRepository: Send + Sync {
    /// Append a feed event. Returns `None` when the durable
    /// `(account, kind, source)` marker already exists — re-delivery of the
    /// same underlying write never produces a second event.
    async fn append(&self, event: NewFeedEvent) -> Result<Option<FeedEvent>>;

    /// Feed events for an account with `seq` greater than `after_seq`,
    /// oldest first. Used by clients resuming after reconnect.
    async fn list_for_account(
        &self,
        account_id: Uuid,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<FeedEvent>>;
}
