//! Sync coordinator: attaches client sessions to the store's change feed.
//!
//! Attach order matters: the bus subscription is taken before the snapshot
//! is read, so no committed write can fall between them. Writes that land
//! during the snapshot read arrive as live events carrying a revision the
//! snapshot already includes, and are dropped as stale.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use cadence_core::defaults::SESSION_BUFFER_SIZE;
use cadence_core::{EventEnvelope, FeedEvent, FeedEventRepository, Result, StoreEvent};
use cadence_store::Database;

use crate::session::{ClientSession, SendOutcome, SessionSender, SyncUpdate};

/// Page size for the reconnect resume backlog.
const RESUME_BATCH: i64 = 200;

/// Hands out [`ClientSession`]s backed by the store's event bus.
#[derive(Clone)]
pub struct SyncCoordinator {
    db: Database,
    buffer_size: usize,
}

impl SyncCoordinator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            buffer_size: SESSION_BUFFER_SIZE,
        }
    }

    /// Override the per-session queue size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Attach a client to an account's change feed.
    ///
    /// The session starts with a full snapshot, then feed events after
    /// `last_feed_seq` (for clients resuming a dropped connection), then
    /// live updates. A resuming client never sees a feed event twice.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn attach(
        &self,
        account_id: Uuid,
        last_feed_seq: Option<i64>,
    ) -> Result<ClientSession> {
        let bus_rx = self.db.bus.subscribe();

        let contacts = self.db.contacts.snapshot_for_account(account_id).await?;
        let reminders = self.db.reminders.snapshot_for_account(account_id).await?;

        let revs: HashMap<Uuid, i64> = contacts
            .iter()
            .map(|c| (c.id, c.rev))
            .chain(reminders.iter().map(|r| (r.id, r.rev)))
            .collect();

        let mut feed_cursor = last_feed_seq.unwrap_or(0);
        let mut backlog = Vec::new();
        loop {
            let batch = self
                .db
                .feed
                .list_for_account(account_id, feed_cursor, RESUME_BATCH)
                .await?;
            let done = (batch.len() as i64) < RESUME_BATCH;
            if let Some(last) = batch.last() {
                feed_cursor = last.seq;
            }
            backlog.extend(batch);
            if done {
                break;
            }
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let session = ClientSession::new(account_id, rx);
        info!(
            session_id = %session.session_id,
            snapshot_contacts = contacts.len(),
            snapshot_reminders = reminders.len(),
            backlog = backlog.len(),
            "Client session attached"
        );

        let snapshot = SyncUpdate::Snapshot {
            contacts,
            reminders,
            feed_cursor,
        };
        let task = ForwardTask {
            account_id,
            sender: SessionSender::new(tx),
            revs,
            feed_cursor,
        };
        tokio::spawn(task.run(snapshot, backlog, bus_rx));

        Ok(session)
    }
}

/// Per-session forwarding state, owned by the session's task.
struct ForwardTask {
    account_id: Uuid,
    sender: SessionSender,
    /// Last revision delivered per entity; stale deliveries are dropped so
    /// the client observes each entity's writes in order.
    revs: HashMap<Uuid, i64>,
    /// Highest feed `seq` delivered; live feed events at or below it were
    /// already covered by the snapshot or resume backlog.
    feed_cursor: i64,
}

impl ForwardTask {
    async fn run(
        mut self,
        snapshot: SyncUpdate,
        backlog: Vec<FeedEvent>,
        mut bus_rx: broadcast::Receiver<EventEnvelope>,
    ) {
        // Prime the session. Blocking sends are fine here: the client has
        // nothing to do but read.
        if matches!(self.sender.send(snapshot).await, SendOutcome::Closed) {
            return;
        }
        for event in backlog {
            if matches!(
                self.sender.send(SyncUpdate::FeedEvent { event }).await,
                SendOutcome::Closed
            ) {
                return;
            }
        }

        loop {
            if self.sender.resync_pending() {
                // The client fell behind. Updates are dropped until the
                // marker fits in the queue; the client reattaches after it.
                tokio::select! {
                    outcome = self.sender.flush_resync() => {
                        if matches!(outcome, SendOutcome::Closed) {
                            break;
                        }
                    }
                    result = bus_rx.recv() => match result {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
                continue;
            }

            match bus_rx.recv().await {
                Ok(envelope) => {
                    if !self.forward(envelope) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        account_id = %self.account_id,
                        skipped,
                        "Bus overrun, session must resync"
                    );
                    self.sender.mark_resync();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(account_id = %self.account_id, "Session forwarding stopped");
    }

    /// Forward one envelope. Returns false when the client went away.
    fn forward(&mut self, envelope: EventEnvelope) -> bool {
        if envelope.account_id != self.account_id {
            return true;
        }

        if let Some(rev) = envelope.payload.rev() {
            let entity_id = envelope.entity_id;
            if let Some(&known) = self.revs.get(&entity_id) {
                if rev <= known {
                    debug!(
                        entity_id = %entity_id,
                        rev,
                        known,
                        "Dropping stale delivery"
                    );
                    return true;
                }
            }
            self.revs.insert(entity_id, rev);
        }

        let update = match envelope.payload {
            StoreEvent::ContactUpserted { contact }
            | StoreEvent::ContactStatusChanged { contact } => {
                SyncUpdate::ContactChanged { contact }
            }
            StoreEvent::ContactDeleted { contact_id } => {
                self.revs.remove(&contact_id);
                SyncUpdate::ContactRemoved { contact_id }
            }
            StoreEvent::ReminderCreated { reminder } | StoreEvent::ReminderUpdated { reminder } => {
                SyncUpdate::ReminderChanged { reminder }
            }
            StoreEvent::ReminderDeleted { reminder_id } => {
                self.revs.remove(&reminder_id);
                SyncUpdate::ReminderRemoved { reminder_id }
            }
            StoreEvent::ResponseRecorded { response } => SyncUpdate::ResponseRecorded { response },
            StoreEvent::FeedEventAppended { event } => {
                if event.seq <= self.feed_cursor {
                    debug!(seq = event.seq, "Dropping already-delivered feed event");
                    return true;
                }
                self.feed_cursor = event.seq;
                SyncUpdate::FeedEvent { event }
            }
        };

        !matches!(self.sender.push(update), SendOutcome::Closed)
    }
}
