//! Inbound response correlation.
//!
//! Webhooks arrive at-least-once and out of order. Every inbound message is
//! recorded exactly once (keyed on the gateway message id) and interpreted
//! against the sender's state: pending contacts are in the enrollment
//! handshake, confirmed contacts complete their most recently dispatched
//! open occurrence.

use chrono::Duration;
use tracing::{debug, info, instrument, warn};

use cadence_core::defaults::{
    COMPLETION_LOOKBACK_HOURS, MAX_RESPONSE_BODY_CHARS, MAX_RESPONSE_MEDIA,
};
use cadence_core::{
    phone, Contact, ContactRepository, ContactStatus, FeedEventRepository, InboundMessage,
    NewFeedEvent, NewResponse, RecordedResponse, ReminderRepository, Response, ResponseOutcome,
    ResponseRepository, ResponseRequirement, Result,
};
use cadence_store::Database;

/// Tokens that reject the enrollment handshake. Anything else accepts: a
/// contact who replies at all is engaging, and a mistaken accept is
/// recoverable while a mistaken reject silently drops them.
const REJECT_TOKENS: &[&str] = &["no", "stop", "cancel", "quit", "unsubscribe", "n"];

/// Correlates inbound messages with contacts and open reminder occurrences.
#[derive(Clone)]
pub struct ResponseCorrelator {
    db: Database,
}

impl ResponseCorrelator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Process one inbound message. Idempotent on `gateway_message_id`:
    /// redelivery returns the originally recorded response and mutates
    /// nothing.
    #[instrument(skip(self, msg), fields(gateway_message_id = %msg.gateway_message_id))]
    pub async fn handle_inbound(&self, msg: InboundMessage) -> Result<Response> {
        if let Some(prior) = self
            .db
            .responses
            .find_by_gateway_id(&msg.gateway_message_id)
            .await?
        {
            debug!("Redelivered message, returning prior record");
            return Ok(prior);
        }

        let (body, media_urls) = degrade_inbound(&msg);

        let contact = match phone::canonicalize(&msg.from_number) {
            Ok(canonical) => self.db.contacts.find_by_phone(&canonical).await?,
            Err(_) => {
                debug!(from = %msg.from_number, "Unparseable sender number");
                None
            }
        };

        let Some(contact) = contact else {
            info!("Inbound from unknown sender, retaining as unmatched");
            return self
                .record(&msg, None, None, body, media_urls, ResponseOutcome::Unmatched)
                .await;
        };

        match contact.status {
            ContactStatus::Pending => {
                self.handle_confirmation(&msg, &contact, body, media_urls)
                    .await
            }
            ContactStatus::Confirmed => {
                self.handle_completion(&msg, &contact, body, media_urls)
                    .await
            }
            ContactStatus::Inactive => {
                debug!(contact_id = %contact.id, "Inbound from inactive contact");
                self.record(
                    &msg,
                    Some(&contact),
                    None,
                    body,
                    media_urls,
                    ResponseOutcome::Unmatched,
                )
                .await
            }
        }
    }

    /// Enrollment handshake: the contact's first reply settles their status.
    async fn handle_confirmation(
        &self,
        msg: &InboundMessage,
        contact: &Contact,
        body: String,
        media_urls: Vec<String>,
    ) -> Result<Response> {
        let rejected = REJECT_TOKENS.contains(&body.trim().to_lowercase().as_str());
        let (status, outcome) = if rejected {
            (ContactStatus::Inactive, ResponseOutcome::ConfirmationReject)
        } else {
            (ContactStatus::Confirmed, ResponseOutcome::ConfirmationAccept)
        };

        let updated = self.db.contacts.set_status(contact.id, status).await?;
        info!(
            contact_id = %contact.id,
            outcome = outcome.as_str(),
            "Enrollment handshake settled"
        );

        if outcome == ResponseOutcome::ConfirmationAccept {
            self.db
                .feed
                .append(NewFeedEvent::contact_confirmed(&updated, msg.received_at))
                .await?;
        }

        self.record(msg, Some(contact), None, body, media_urls, outcome)
            .await
    }

    /// Completion flow: match the sender's most recent open occurrence.
    async fn handle_completion(
        &self,
        msg: &InboundMessage,
        contact: &Contact,
        body: String,
        media_urls: Vec<String>,
    ) -> Result<Response> {
        let since = msg.received_at - Duration::hours(COMPLETION_LOOKBACK_HOURS);
        let open = self
            .db
            .reminders
            .latest_open_for_contact(contact.id, since)
            .await?;

        let Some(reminder) = open else {
            // No open occurrence. If the latest dispatched one in the window
            // was already completed, this is a second reply to it: recorded
            // as a non-mutating duplicate, not as unmatched.
            if let Some(done) = self
                .db
                .reminders
                .latest_dispatched_for_contact(contact.id, since)
                .await?
            {
                debug!(reminder_id = %done.id, "Occurrence already completed");
                return self
                    .record(msg, Some(contact), Some(done.id), body, media_urls, ResponseOutcome::Duplicate)
                    .await;
            }
            debug!(contact_id = %contact.id, "No occurrence in lookback window");
            return self
                .record(msg, Some(contact), None, body, media_urls, ResponseOutcome::Unmatched)
                .await;
        };

        if !satisfies(reminder.requirement, &body, &media_urls) {
            debug!(
                reminder_id = %reminder.id,
                requirement = reminder.requirement.as_str(),
                "Reply does not satisfy the response requirement"
            );
            return self
                .record(msg, Some(contact), Some(reminder.id), body, media_urls, ResponseOutcome::Unmatched)
                .await;
        }

        // First writer wins; a racing reply records as a duplicate.
        let outcome = if self
            .db
            .reminders
            .complete_occurrence(reminder.id, msg.received_at)
            .await?
        {
            info!(reminder_id = %reminder.id, contact_id = %contact.id, "Occurrence completed");
            self.db
                .feed
                .append(NewFeedEvent::reminder_completed(&reminder, msg.received_at))
                .await?;
            ResponseOutcome::Completion
        } else {
            debug!(reminder_id = %reminder.id, "Occurrence already completed");
            ResponseOutcome::Duplicate
        };

        self.record(msg, Some(contact), Some(reminder.id), body, media_urls, outcome)
            .await
    }

    async fn record(
        &self,
        msg: &InboundMessage,
        contact: Option<&Contact>,
        reminder_id: Option<uuid::Uuid>,
        body: String,
        media_urls: Vec<String>,
        outcome: ResponseOutcome,
    ) -> Result<Response> {
        let recorded = self
            .db
            .responses
            .record(NewResponse {
                account_id: contact.map(|c| c.account_id),
                contact_id: contact.map(|c| c.id),
                reminder_id,
                body,
                media_urls,
                gateway_message_id: msg.gateway_message_id.clone(),
                received_at: msg.received_at,
                outcome,
            })
            .await?;

        if let RecordedResponse::AlreadyProcessed(ref prior) = recorded {
            // Lost an insert race with a concurrent redelivery; the prior
            // row is authoritative.
            warn!(
                gateway_message_id = %msg.gateway_message_id,
                "Concurrent redelivery, keeping first record"
            );
            return Ok(prior.clone());
        }
        Ok(recorded.response().clone())
    }
}

/// Truncate oversized inbound payloads instead of rejecting them.
fn degrade_inbound(msg: &InboundMessage) -> (String, Vec<String>) {
    let body = if msg.body.chars().count() > MAX_RESPONSE_BODY_CHARS {
        warn!(
            gateway_message_id = %msg.gateway_message_id,
            chars = msg.body.chars().count(),
            "Truncating oversized body"
        );
        msg.body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
    } else {
        msg.body.clone()
    };

    let mut media_urls = msg.media_urls.clone();
    if media_urls.len() > MAX_RESPONSE_MEDIA {
        warn!(
            gateway_message_id = %msg.gateway_message_id,
            count = media_urls.len(),
            "Dropping media beyond the cap"
        );
        media_urls.truncate(MAX_RESPONSE_MEDIA);
    }
    (body, media_urls)
}

/// Whether a reply satisfies the reminder's response requirement.
fn satisfies(requirement: ResponseRequirement, body: &str, media_urls: &[String]) -> bool {
    let has_text = !body.trim().is_empty();
    let has_media = !media_urls.is_empty();
    match requirement {
        ResponseRequirement::Photo => has_media,
        ResponseRequirement::Text => has_text,
        ResponseRequirement::Either => has_text || has_media,
    }
}
