//! Client session types.
//!
//! A session is a bounded queue of [`SyncUpdate`]s for one connected client.
//! The coordinator never blocks on a slow client: when the queue is full,
//! updates are dropped and the session is flagged for resync.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use cadence_core::{Contact, FeedEvent, Reminder, Response};

/// An update delivered to a connected client, in order.
///
/// Wire shape is JSON with a `type` tag, matching [`cadence_core::StoreEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncUpdate {
    /// Initial full state for the account. Always the first update on a
    /// session; `feed_cursor` is the client's resume position.
    Snapshot {
        contacts: Vec<Contact>,
        reminders: Vec<Reminder>,
        feed_cursor: i64,
    },
    /// A contact was created, re-enrolled, or changed state.
    ContactChanged { contact: Contact },
    ContactRemoved { contact_id: Uuid },
    /// A reminder was created or changed (edits, schedule advances,
    /// completions).
    ReminderChanged { reminder: Reminder },
    ReminderRemoved { reminder_id: Uuid },
    /// An inbound response was recorded.
    ResponseRecorded { response: Response },
    /// A feed event, deduplicated and in `seq` order.
    FeedEvent { event: FeedEvent },
    /// The session dropped updates (slow client or bus overrun). The client
    /// must reattach for a fresh snapshot; everything after this marker is
    /// unreliable.
    ResyncRequired,
}

impl SyncUpdate {
    /// Wire-level type tag, used as the SSE event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncUpdate::Snapshot { .. } => "Snapshot",
            SyncUpdate::ContactChanged { .. } => "ContactChanged",
            SyncUpdate::ContactRemoved { .. } => "ContactRemoved",
            SyncUpdate::ReminderChanged { .. } => "ReminderChanged",
            SyncUpdate::ReminderRemoved { .. } => "ReminderRemoved",
            SyncUpdate::ResponseRecorded { .. } => "ResponseRecorded",
            SyncUpdate::FeedEvent { .. } => "FeedEvent",
            SyncUpdate::ResyncRequired => "ResyncRequired",
        }
    }
}

/// Receiving half of a session, handed to the transport layer.
pub struct ClientSession {
    pub session_id: Uuid,
    pub account_id: Uuid,
    rx: mpsc::Receiver<SyncUpdate>,
}

impl ClientSession {
    pub(crate) fn new(account_id: Uuid, rx: mpsc::Receiver<SyncUpdate>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            account_id,
            rx,
        }
    }

    /// Next update, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<SyncUpdate> {
        self.rx.recv().await
    }
}

/// Sending half of a session, owned by the coordinator's forwarding task.
///
/// Sends never block: a full queue drops the update and arms the resync
/// marker, which is delivered as soon as the queue has room again.
pub(crate) struct SessionSender {
    tx: mpsc::Sender<SyncUpdate>,
    resync_pending: bool,
}

pub(crate) enum SendOutcome {
    /// Update queued (possibly after a resync marker).
    Delivered,
    /// Update dropped; the session will resync.
    Dropped,
    /// The client went away; the forwarding task should stop.
    Closed,
}

impl SessionSender {
    pub(crate) fn new(tx: mpsc::Sender<SyncUpdate>) -> Self {
        Self {
            tx,
            resync_pending: false,
        }
    }

    /// Queue an update for the client without blocking.
    pub(crate) fn push(&mut self, update: SyncUpdate) -> SendOutcome {
        if self.resync_pending {
            // Everything since the overflow is already lost; the pending
            // marker supersedes individual updates.
            return SendOutcome::Dropped;
        }

        match self.tx.try_send(update) {
            Ok(()) => SendOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.resync_pending = true;
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Arm the resync marker directly (bus overrun).
    pub(crate) fn mark_resync(&mut self) {
        self.resync_pending = true;
    }

    pub(crate) fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    /// Deliver the armed resync marker, waiting for queue room. Must only
    /// be called while the marker is pending.
    pub(crate) async fn flush_resync(&mut self) -> SendOutcome {
        match self.tx.reserve().await {
            Ok(permit) => {
                permit.send(SyncUpdate::ResyncRequired);
                self.resync_pending = false;
                SendOutcome::Delivered
            }
            Err(_) => SendOutcome::Closed,
        }
    }

    /// Blocking send, used only while priming the session with the snapshot
    /// and resume backlog before live forwarding starts.
    pub(crate) async fn send(&self, update: SyncUpdate) -> SendOutcome {
        match self.tx.send(update).await {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => SendOutcome::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_overflow_arms_resync() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sender = SessionSender::new(tx);

        assert!(matches!(
            sender.push(SyncUpdate::ContactRemoved {
                contact_id: Uuid::new_v4()
            }),
            SendOutcome::Delivered
        ));
        // Queue full: dropped, resync armed.
        assert!(matches!(
            sender.push(SyncUpdate::ContactRemoved {
                contact_id: Uuid::new_v4()
            }),
            SendOutcome::Dropped
        ));
        assert!(sender.resync_pending());

        // While armed, further pushes are dropped outright.
        assert!(matches!(
            sender.push(SyncUpdate::ContactRemoved {
                contact_id: Uuid::new_v4()
            }),
            SendOutcome::Dropped
        ));

        // Drain, then the flush delivers the marker.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, SyncUpdate::ContactRemoved { .. }));
        assert!(matches!(sender.flush_resync().await, SendOutcome::Delivered));
        assert!(!sender.resync_pending());

        let marker = rx.recv().await.unwrap();
        assert!(matches!(marker, SyncUpdate::ResyncRequired));
    }

    #[tokio::test]
    async fn test_push_to_closed_session() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sender = SessionSender::new(tx);
        assert!(matches!(
            sender.push(SyncUpdate::ResyncRequired),
            SendOutcome::Closed
        ));
    }

    #[test]
    fn test_sync_update_wire_shape() {
        let update = SyncUpdate::ContactRemoved {
            contact_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"type\":\"ContactRemoved\""));
    }
}
