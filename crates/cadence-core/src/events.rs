//! Store change events and the broadcast event bus.
//!
//! Every committed store mutation is published on the bus as an
//! [`EventEnvelope`]. Downstream consumers (the sync coordinator, tests)
//! subscribe independently; with no active subscribers an emission is
//! silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Contact, FeedEvent, Reminder, Response};

/// Domain payload of a store mutation, exhaustively matched by consumers.
///
/// Serialized as JSON with a `type` tag, e.g.
/// `{"type":"ReminderUpdated","reminder":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StoreEvent {
    /// A contact was created or re-enrolled.
    ContactUpserted { contact: Contact },
    /// A contact's confirmation state changed.
    ContactStatusChanged { contact: Contact },
    /// A contact was deleted (cascade).
    ContactDeleted { contact_id: Uuid },
    /// A reminder was created.
    ReminderCreated { reminder: Reminder },
    /// A reminder was updated (schedule advance, completion, edits).
    ReminderUpdated { reminder: Reminder },
    /// A reminder was deleted (cascade).
    ReminderDeleted { reminder_id: Uuid },
    /// An inbound response was recorded.
    ResponseRecorded { response: Response },
    /// A new feed event was appended (already deduplicated by the store).
    FeedEventAppended { event: FeedEvent },
}

impl StoreEvent {
    /// Namespaced event type for logging and wire framing.
    pub fn event_type(&self) -> &'static str {
        match self {
            StoreEvent::ContactUpserted { .. } => "contact.upserted",
            StoreEvent::ContactStatusChanged { .. } => "contact.status_changed",
            StoreEvent::ContactDeleted { .. } => "contact.deleted",
            StoreEvent::ReminderCreated { .. } => "reminder.created",
            StoreEvent::ReminderUpdated { .. } => "reminder.updated",
            StoreEvent::ReminderDeleted { .. } => "reminder.deleted",
            StoreEvent::ResponseRecorded { .. } => "response.recorded",
            StoreEvent::FeedEventAppended { .. } => "feed.appended",
        }
    }

    /// Entity type this event relates to.
    pub fn entity_type(&self) -> &'static str {
        match self {
            StoreEvent::ContactUpserted { .. }
            | StoreEvent::ContactStatusChanged { .. }
            | StoreEvent::ContactDeleted { .. } => "contact",
            StoreEvent::ReminderCreated { .. }
            | StoreEvent::ReminderUpdated { .. }
            | StoreEvent::ReminderDeleted { .. } => "reminder",
            StoreEvent::ResponseRecorded { .. } => "response",
            StoreEvent::FeedEventAppended { .. } => "feed_event",
        }
    }

    /// Id of the entity this event relates to.
    pub fn entity_id(&self) -> Uuid {
        match self {
            StoreEvent::ContactUpserted { contact }
            | StoreEvent::ContactStatusChanged { contact } => contact.id,
            StoreEvent::ContactDeleted { contact_id } => *contact_id,
            StoreEvent::ReminderCreated { reminder }
            | StoreEvent::ReminderUpdated { reminder } => reminder.id,
            StoreEvent::ReminderDeleted { reminder_id } => *reminder_id,
            StoreEvent::ResponseRecorded { response } => response.id,
            StoreEvent::FeedEventAppended { event } => event.id,
        }
    }

    /// Row revision carried by the payload, when the entity has one.
    ///
    /// Consumers needing per-entity write order compare revisions and drop
    /// stale deliveries.
    pub fn rev(&self) -> Option<i64> {
        match self {
            StoreEvent::ContactUpserted { contact }
            | StoreEvent::ContactStatusChanged { contact } => Some(contact.rev),
            StoreEvent::ReminderCreated { reminder }
            | StoreEvent::ReminderUpdated { reminder } => Some(reminder.rev),
            _ => None,
        }
    }
}

/// Versioned envelope wrapping a [`StoreEvent`] with routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type (e.g. `"reminder.updated"`).
    pub event_type: String,
    /// Account whose hierarchy this event belongs to.
    pub account_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub payload: StoreEvent,
}

impl EventEnvelope {
    pub fn new(account_id: Uuid, payload: StoreEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: payload.event_type().to_string(),
            account_id,
            entity_type: payload.entity_type().to_string(),
            entity_id: payload.entity_id(),
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// Broadcast bus over store change events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, account_id: Uuid, event: StoreEvent) {
        let envelope = EventEnvelope::new(account_id, event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            account_id = %envelope.account_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events. Each subscriber gets its own
    /// independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let account_id = Uuid::new_v4();
        let contact_id = Uuid::new_v4();

        bus.emit(account_id, StoreEvent::ContactDeleted { contact_id });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.account_id, account_id);
        assert_eq!(envelope.entity_id, contact_id);
        assert_eq!(envelope.event_type, "contact.deleted");
        assert!(matches!(
            envelope.payload,
            StoreEvent::ContactDeleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_event_bus_no_subscribers_is_fine() {
        let bus = EventBus::new(4);
        // No receiver attached; emission must not error or panic.
        bus.emit(
            Uuid::new_v4(),
            StoreEvent::ReminderDeleted {
                reminder_id: Uuid::new_v4(),
            },
        );
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let envelope = EventEnvelope::new(
            Uuid::new_v4(),
            StoreEvent::ContactDeleted {
                contact_id: Uuid::new_v4(),
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id, envelope.event_id);
        assert_eq!(back.event_type, "contact.deleted");
    }
}
