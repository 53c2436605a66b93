//! Integration tests for inbound response correlation.

use chrono::{DateTime, Duration, Utc};

use cadence_core::{
    ContactRepository, ContactStatus, CreateReminderRequest, FeedEventKind, FeedEventRepository,
    InboundMessage, RecurrenceRule, Reminder, ReminderRepository, ResponseOutcome,
    ResponseRepository, ResponseRequirement,
};
use cadence_dispatch::ResponseCorrelator;
use cadence_store::test_fixtures::TestDatabase;

fn inbound(from: &str, body: &str, gateway_message_id: &str) -> InboundMessage {
    InboundMessage {
        from_number: from.to_string(),
        body: body.to_string(),
        media_urls: vec![],
        gateway_message_id: gateway_message_id.to_string(),
        received_at: Utc::now(),
    }
}

/// Put a reminder through a successful dispatch so its occurrence is open.
async fn dispatch_occurrence(t: &TestDatabase, reminder: &Reminder) -> DateTime<Utc> {
    let due = Utc::now() - Duration::minutes(10);
    t.backdate_next_due(reminder.id, due).await;
    let dispatched = Utc::now() - Duration::minutes(9);
    assert!(t
        .db
        .reminders
        .claim(reminder.id, due, dispatched)
        .await
        .unwrap());
    t.db
        .reminders
        .reschedule(reminder.id, Some(Utc::now() + Duration::days(1)), dispatched)
        .await
        .unwrap();
    dispatched
}

#[tokio::test]
async fn test_pending_contact_accepts_enrollment() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_contact("+15551234567", "Dana").await;
    assert_eq!(contact.status, ContactStatus::Pending);

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "yes", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::ConfirmationAccept);
    assert_eq!(response.contact_id, Some(contact.id));

    let after = t.db.contacts.fetch(contact.id).await.unwrap();
    assert_eq!(after.status, ContactStatus::Confirmed);
    assert!(after.confirmed_at.is_some());

    let feed = t.db.feed.list_for_account(t.account_id, 0, 10).await.unwrap();
    assert!(feed.iter().any(|e| e.kind == FeedEventKind::ContactConfirmed));
}

#[tokio::test]
async fn test_lenient_accept_takes_any_non_negative_reply() {
    let t = TestDatabase::new().await;
    t.enroll_contact("+15551234567", "Dana").await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "sounds good, thanks!", "SM1"))
        .await
        .unwrap();
    assert_eq!(response.outcome, ResponseOutcome::ConfirmationAccept);
}

#[tokio::test]
async fn test_negative_reply_rejects_enrollment() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_contact("+15551234567", "Dana").await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", " STOP ", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::ConfirmationReject);
    let after = t.db.contacts.fetch(contact.id).await.unwrap();
    assert_eq!(after.status, ContactStatus::Inactive);

    // Rejection produces no feed announcement.
    let feed = t.db.feed.list_for_account(t.account_id, 0, 10).await.unwrap();
    assert!(feed.iter().all(|e| e.kind != FeedEventKind::ContactConfirmed));
}

#[tokio::test]
async fn test_reply_completes_open_occurrence() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    let reminder = t.create_daily_reminder(contact.id, "take meds").await;
    dispatch_occurrence(&t, &reminder).await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::Completion);
    assert_eq!(response.reminder_id, Some(reminder.id));

    let after = t.db.reminders.fetch(reminder.id).await.unwrap();
    assert_eq!(after.completion_count, 1);

    let feed = t.db.feed.list_for_account(t.account_id, 0, 10).await.unwrap();
    assert!(feed.iter().any(|e| e.kind == FeedEventKind::ReminderCompleted));
}

#[tokio::test]
async fn test_second_reply_records_as_duplicate() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    let reminder = t.create_daily_reminder(contact.id, "take meds").await;
    dispatch_occurrence(&t, &reminder).await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();
    let second = correlator
        .handle_inbound(inbound("+15551234567", "did it!", "SM2"))
        .await
        .unwrap();

    assert_eq!(second.outcome, ResponseOutcome::Duplicate);
    assert_eq!(second.reminder_id, Some(reminder.id));
    let after = t.db.reminders.fetch(reminder.id).await.unwrap();
    assert_eq!(after.completion_count, 1, "duplicates never double-count");

    // The feed announces one completion, not two.
    let completions = t
        .db
        .feed
        .list_for_account(t.account_id, 0, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == FeedEventKind::ReminderCompleted)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn test_redelivered_webhook_is_idempotent() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    let reminder = t.create_daily_reminder(contact.id, "take meds").await;
    dispatch_occurrence(&t, &reminder).await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let first = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();
    let replay = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();

    assert_eq!(first.id, replay.id);
    assert_eq!(replay.outcome, ResponseOutcome::Completion);

    let after = t.db.reminders.fetch(reminder.id).await.unwrap();
    assert_eq!(after.completion_count, 1);
    let history = t
        .db
        .responses
        .list_for_contact(contact.id, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_unknown_sender_is_retained_unmatched() {
    let t = TestDatabase::new().await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15550009999", "hello?", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::Unmatched);
    assert_eq!(response.contact_id, None);
    assert_eq!(response.account_id, None);

    // Retained as audit trail despite matching nothing.
    let stored = t.db.responses.find_by_gateway_id("SM1").await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_reply_without_open_occurrence_is_unmatched() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    t.create_daily_reminder(contact.id, "take meds").await;

    // Nothing has been dispatched yet.
    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::Unmatched);
    assert_eq!(response.reminder_id, None);
}

#[tokio::test]
async fn test_photo_requirement_rejects_text_only_reply() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    let reminder = t
        .db
        .reminders
        .create(CreateReminderRequest {
            contact_id: contact.id,
            title: "water the garden".into(),
            rule: RecurrenceRule::Daily,
            time_of_day: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
            requirement: ResponseRequirement::Photo,
        })
        .await
        .unwrap();
    dispatch_occurrence(&t, &reminder).await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let text_only = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();
    assert_eq!(text_only.outcome, ResponseOutcome::Unmatched);

    let with_photo = correlator
        .handle_inbound(InboundMessage {
            from_number: "+15551234567".into(),
            body: String::new(),
            media_urls: vec!["https://example.com/garden.jpg".into()],
            gateway_message_id: "SM2".into(),
            received_at: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(with_photo.outcome, ResponseOutcome::Completion);
}

#[tokio::test]
async fn test_stale_occurrence_outside_lookback_is_unmatched() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_confirmed_contact("+15551234567").await;
    let reminder = t.create_daily_reminder(contact.id, "take meds").await;

    // Dispatch far enough in the past to fall outside the lookback window.
    let due = Utc::now() - Duration::hours(50);
    t.backdate_next_due(reminder.id, due).await;
    let dispatched = Utc::now() - Duration::hours(49);
    assert!(t
        .db
        .reminders
        .claim(reminder.id, due, dispatched)
        .await
        .unwrap());
    t.db
        .reminders
        .reschedule(reminder.id, Some(Utc::now() + Duration::days(1)), dispatched)
        .await
        .unwrap();

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "done", "SM1"))
        .await
        .unwrap();
    assert_eq!(response.outcome, ResponseOutcome::Unmatched);
}

#[tokio::test]
async fn test_inactive_contact_reply_is_unmatched() {
    let t = TestDatabase::new().await;
    let contact = t.enroll_contact("+15551234567", "Dana").await;
    t.db
        .contacts
        .set_status(contact.id, ContactStatus::Inactive)
        .await
        .unwrap();

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("+15551234567", "yes", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::Unmatched);
    // An opted-out contact is never silently resurrected.
    let after = t.db.contacts.fetch(contact.id).await.unwrap();
    assert_eq!(after.status, ContactStatus::Inactive);
}

#[tokio::test]
async fn test_unparseable_sender_number_retained() {
    let t = TestDatabase::new().await;

    let correlator = ResponseCorrelator::new(t.db.clone());
    let response = correlator
        .handle_inbound(inbound("not-a-number", "hi", "SM1"))
        .await
        .unwrap();

    assert_eq!(response.outcome, ResponseOutcome::Unmatched);
    assert_eq!(response.contact_id, None);
}

#[tokio::test]
async fn test_contact_id_stable_across_reenrollment() {
    // A deleted-then-reenrolled number lands on the same contact id, so
    // historical responses keyed by contact stay attributable.
    let t = TestDatabase::new().await;
    let first = t.enroll_contact("+15551234567", "Dana").await;
    let stats = t.db.lifecycle.delete_contact(first.id).await.unwrap();
    assert_eq!(stats.contacts, 1);

    let again = t.enroll_contact("+15551234567", "Dana").await;
    assert_eq!(first.id, again.id);
}
