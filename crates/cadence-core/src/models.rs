//! Core data models for cadence.
//!
//! These types are shared across all cadence crates and represent the domain
//! hierarchy: account → contacts → {reminders, responses} plus the derived
//! feed event projection.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// CONTACT TYPES
// =============================================================================

/// Confirmation state of an enrolled contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// Enrolled, confirmation SMS sent, awaiting reply.
    Pending,
    /// Contact replied affirmatively; reminders may be dispatched.
    Confirmed,
    /// Contact opted out or was deactivated by the account.
    Inactive,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Confirmed => "confirmed",
            ContactStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ContactStatus::Pending),
            "confirmed" => Some(ContactStatus::Confirmed),
            "inactive" => Some(ContactStatus::Inactive),
            _ => None,
        }
    }
}

/// An enrolled message recipient, owned by an account.
///
/// Identity is deterministic over (account, canonical phone number), so
/// re-enrolling the same number updates the existing row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Canonical E.164 phone number.
    pub phone: String,
    pub display_name: String,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Monotonic row revision, bumped on every write. Consumers use this to
    /// drop stale updates delivered out of order.
    pub rev: i64,
}

// =============================================================================
// REMINDER TYPES
// =============================================================================

/// Day of the week for custom recurrence sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn to_weekday(self) -> Weekday {
        match self {
            DayOfWeek::Mon => Weekday::Mon,
            DayOfWeek::Tue => Weekday::Tue,
            DayOfWeek::Wed => Weekday::Wed,
            DayOfWeek::Thu => Weekday::Thu,
            DayOfWeek::Fri => Weekday::Fri,
            DayOfWeek::Sat => Weekday::Sat,
            DayOfWeek::Sun => Weekday::Sun,
        }
    }

    pub fn from_weekday(w: Weekday) -> Self {
        match w {
            Weekday::Mon => DayOfWeek::Mon,
            Weekday::Tue => DayOfWeek::Tue,
            Weekday::Wed => DayOfWeek::Wed,
            Weekday::Thu => DayOfWeek::Thu,
            Weekday::Fri => DayOfWeek::Fri,
            Weekday::Sat => DayOfWeek::Sat,
            Weekday::Sun => DayOfWeek::Sun,
        }
    }
}

/// Recurrence rule for a reminder.
///
/// Serialized as tagged JSON both on the wire and in the store, e.g.
/// `{"kind":"days_of_week","days":["mon","wed","fri"]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// Fires once at the configured instant, then is exhausted.
    OneTime { at: DateTime<Utc> },
    /// Every day at the configured time-of-day.
    Daily,
    /// Monday through Friday in the reminder's timezone.
    Weekdays,
    /// An explicit set of weekdays. An empty set is a configuration error,
    /// rejected at creation time.
    DaysOfWeek { days: Vec<DayOfWeek> },
}

/// What kind of reply completes an occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseRequirement {
    Photo,
    Text,
    Either,
}

impl ResponseRequirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseRequirement::Photo => "photo",
            ResponseRequirement::Text => "text",
            ResponseRequirement::Either => "either",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(ResponseRequirement::Photo),
            "text" => Some(ResponseRequirement::Text),
            "either" => Some(ResponseRequirement::Either),
            _ => None,
        }
    }
}

/// Lifecycle status of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Active,
    Paused,
    /// Terminal: a one-time rule fired, or the account closed it out.
    Completed,
    Archived,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Active => "active",
            ReminderStatus::Paused => "paused",
            ReminderStatus::Completed => "completed",
            ReminderStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReminderStatus::Active),
            "paused" => Some(ReminderStatus::Paused),
            "completed" => Some(ReminderStatus::Completed),
            "archived" => Some(ReminderStatus::Archived),
            _ => None,
        }
    }
}

/// A recurring scheduled prompt sent to a contact.
///
/// Invariant: while `status` is `Active`, `next_due` is `Some` future instant
/// and is monotonically non-decreasing across successful dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub contact_id: Uuid,
    /// Denormalized owning account for feed scoping.
    pub account_id: Uuid,
    pub title: String,
    pub rule: RecurrenceRule,
    /// Wall-clock time of day in the reminder's timezone.
    pub time_of_day: NaiveTime,
    pub timezone: Tz,
    pub requirement: ResponseRequirement,
    pub status: ReminderStatus,
    pub next_due: Option<DateTime<Utc>>,
    pub send_count: i64,
    pub completion_count: i64,
    pub last_dispatched_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Set when the last occurrence exhausted its delivery retries; cleared
    /// on the next successful dispatch. Surfaced to clients as data.
    pub last_send_failed: bool,
    pub created_at: DateTime<Utc>,
    pub rev: i64,
}

impl Reminder {
    /// Whether an inbound reply can still complete the most recent occurrence.
    ///
    /// True when the latest dispatch happened at or after `since` and no
    /// completion has been recorded for it yet.
    pub fn occurrence_open_since(&self, since: DateTime<Utc>) -> bool {
        match self.last_dispatched_at {
            Some(dispatched) if dispatched >= since => match self.last_completed_at {
                Some(completed) => completed < dispatched,
                None => true,
            },
            _ => false,
        }
    }
}

// =============================================================================
// RESPONSE TYPES
// =============================================================================

/// How an inbound message was interpreted by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Matched and completed a dispatched reminder occurrence.
    Completion,
    /// Accepted the enrollment confirmation handshake.
    ConfirmationAccept,
    /// Rejected the enrollment confirmation handshake.
    ConfirmationReject,
    /// A second reply to an already-completed occurrence; recorded, mutates
    /// nothing.
    Duplicate,
    /// No contact or no open occurrence matched; retained for history.
    Unmatched,
}

impl ResponseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseOutcome::Completion => "completion",
            ResponseOutcome::ConfirmationAccept => "confirmation_accept",
            ResponseOutcome::ConfirmationReject => "confirmation_reject",
            ResponseOutcome::Duplicate => "duplicate",
            ResponseOutcome::Unmatched => "unmatched",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completion" => Some(ResponseOutcome::Completion),
            "confirmation_accept" => Some(ResponseOutcome::ConfirmationAccept),
            "confirmation_reject" => Some(ResponseOutcome::ConfirmationReject),
            "duplicate" => Some(ResponseOutcome::Duplicate),
            "unmatched" => Some(ResponseOutcome::Unmatched),
            _ => None,
        }
    }
}

/// An inbound reply, matched (or not) to a reminder.
///
/// Responses are an audit trail: they are retained even if the reminder is
/// later archived, and unresolvable senders still produce a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub reminder_id: Option<Uuid>,
    pub body: String,
    pub media_urls: Vec<String>,
    /// Gateway-assigned message id; the correlator's idempotency key.
    pub gateway_message_id: String,
    pub received_at: DateTime<Utc>,
    pub outcome: ResponseOutcome,
}

/// Inbound webhook payload from the messaging gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from_number: String,
    pub body: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub gateway_message_id: String,
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// FEED EVENT TYPES
// =============================================================================

/// Kind of a UI-facing feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventKind {
    ContactEnrolled,
    ContactConfirmed,
    ReminderCompleted,
    SendFailed,
}

impl FeedEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedEventKind::ContactEnrolled => "contact_enrolled",
            FeedEventKind::ContactConfirmed => "contact_confirmed",
            FeedEventKind::ReminderCompleted => "reminder_completed",
            FeedEventKind::SendFailed => "send_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contact_enrolled" => Some(FeedEventKind::ContactEnrolled),
            "contact_confirmed" => Some(FeedEventKind::ContactConfirmed),
            "reminder_completed" => Some(FeedEventKind::ReminderCompleted),
            "send_failed" => Some(FeedEventKind::SendFailed),
            _ => None,
        }
    }
}

/// A deduplicated, client-facing projection of a state change.
///
/// One-to-one with the causing mutation: the `(account, kind, source)` row is
/// the durable already-emitted marker, so replaying the underlying write never
/// announces a second feed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Monotonic per-store sequence; clients resume from their last seen seq.
    pub seq: i64,
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: FeedEventKind,
    /// Id of the Contact or Reminder mutation that caused this event.
    pub source_id: Uuid,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
}

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Request to enroll (or re-enroll) a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollContactRequest {
    pub account_id: Uuid,
    /// Raw phone number; canonicalized to E.164 by the store.
    pub phone: String,
    pub display_name: String,
}

/// Request to create a reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReminderRequest {
    pub contact_id: Uuid,
    pub title: String,
    pub rule: RecurrenceRule,
    pub time_of_day: NaiveTime,
    pub timezone: Tz,
    pub requirement: ResponseRequirement,
}

/// Request to update a reminder. Schedule-owned fields (`next_due`, counters)
/// are never settable from the outside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateReminderRequest {
    pub title: Option<String>,
    pub rule: Option<RecurrenceRule>,
    pub time_of_day: Option<NaiveTime>,
    pub timezone: Option<Tz>,
    pub requirement: Option<ResponseRequirement>,
    pub status: Option<ReminderStatus>,
}

/// A new response row to record.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub account_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub reminder_id: Option<Uuid>,
    pub body: String,
    pub media_urls: Vec<String>,
    pub gateway_message_id: String,
    pub received_at: DateTime<Utc>,
    pub outcome: ResponseOutcome,
}

/// A new feed event to append (deduplicated by the store).
#[derive(Debug, Clone)]
pub struct NewFeedEvent {
    pub account_id: Uuid,
    pub kind: FeedEventKind,
    pub source_id: Uuid,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
    /// Durable already-emitted marker for the causing write. Two completions
    /// of the same reminder are distinct writes and get distinct keys;
    /// re-delivery of one write reuses the same key and is dropped.
    pub dedup_key: String,
}

impl NewFeedEvent {
    pub fn contact_enrolled(contact: &Contact) -> Self {
        Self {
            account_id: contact.account_id,
            kind: FeedEventKind::ContactEnrolled,
            source_id: contact.id,
            title: format!("{} enrolled", contact.display_name),
            occurred_at: contact.created_at,
            dedup_key: format!("enrolled:{}", contact.id),
        }
    }

    pub fn contact_confirmed(contact: &Contact, at: DateTime<Utc>) -> Self {
        Self {
            account_id: contact.account_id,
            kind: FeedEventKind::ContactConfirmed,
            source_id: contact.id,
            title: format!("{} confirmed", contact.display_name),
            occurred_at: at,
            dedup_key: format!("confirmed:{}", contact.id),
        }
    }

    pub fn reminder_completed(reminder: &Reminder, at: DateTime<Utc>) -> Self {
        Self {
            account_id: reminder.account_id,
            kind: FeedEventKind::ReminderCompleted,
            source_id: reminder.id,
            title: format!("{} completed", reminder.title),
            occurred_at: at,
            dedup_key: format!("completed:{}:{}", reminder.id, at.timestamp_millis()),
        }
    }

    pub fn send_failed(reminder: &Reminder, at: DateTime<Utc>) -> Self {
        Self {
            account_id: reminder.account_id,
            kind: FeedEventKind::SendFailed,
            source_id: reminder.id,
            title: format!("could not deliver {}", reminder.title),
            occurred_at: at,
            dedup_key: format!("send_failed:{}:{}", reminder.id, at.timestamp_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_round_trip() {
        for s in [
            ContactStatus::Pending,
            ContactStatus::Confirmed,
            ContactStatus::Inactive,
        ] {
            assert_eq!(ContactStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            ReminderStatus::Active,
            ReminderStatus::Paused,
            ReminderStatus::Completed,
            ReminderStatus::Archived,
        ] {
            assert_eq!(ReminderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ContactStatus::parse("bogus"), None);
    }

    #[test]
    fn test_recurrence_rule_json_shape() {
        let rule = RecurrenceRule::DaysOfWeek {
            days: vec![DayOfWeek::Mon, DayOfWeek::Fri],
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "days_of_week");
        assert_eq!(json["days"][0], "mon");

        let back: RecurrenceRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_occurrence_open_since() {
        let dispatched = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let mut reminder = sample_reminder();
        reminder.last_dispatched_at = Some(dispatched);

        let since = dispatched - chrono::Duration::hours(1);
        assert!(reminder.occurrence_open_since(since));

        // Completed after dispatch: closed.
        reminder.last_completed_at = Some(dispatched + chrono::Duration::minutes(5));
        assert!(!reminder.occurrence_open_since(since));

        // Completed before this dispatch (prior occurrence): still open.
        reminder.last_completed_at = Some(dispatched - chrono::Duration::days(1));
        assert!(reminder.occurrence_open_since(since));

        // Dispatch outside the lookback window: closed.
        assert!(!reminder.occurrence_open_since(dispatched + chrono::Duration::hours(1)));
    }

    fn sample_reminder() -> Reminder {
        Reminder {
            id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            title: "meds".into(),
            rule: RecurrenceRule::Daily,
            time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
            requirement: ResponseRequirement::Either,
            status: ReminderStatus::Active,
            next_due: None,
            send_count: 0,
            completion_count: 0,
            last_dispatched_at: None,
            last_completed_at: None,
            last_send_failed: false,
            created_at: Utc::now(),
            rev: 1,
        }
    }
}
