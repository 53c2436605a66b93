//! Reminder dispatcher: polls for due reminders, claims them, and delivers
//! over the messaging gateway.
//!
//! Triggers are at-least-once: a poll tick may observe a reminder another
//! tick (or another process) is already delivering. The claim
//! compare-and-swap in the store is what collapses that to one send per
//! occurrence; losing a claim is a silent skip, not an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use cadence_core::defaults::{
    DISPATCH_MAX_CONCURRENT, DISPATCH_POLL_INTERVAL_SECS, DISPATCH_WINDOW_SLACK_SECS,
    EVENT_BUS_CAPACITY, SEND_MAX_ATTEMPTS, SEND_RETRY_BACKOFF_MS,
};
use cadence_core::{
    next_occurrence, ContactRepository, ContactStatus, FeedEventRepository, NewFeedEvent,
    Occurrence, Reminder, ReminderRepository, ResponseRequirement, Result,
};
use cadence_store::Database;

use crate::gateway::MessagingGateway;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Polling interval in seconds.
    pub poll_interval_secs: u64,
    /// Slack behind the poll interval; a reminder stays dispatchable until
    /// `poll_interval + slack` past its `next_due`.
    pub window_slack_secs: i64,
    /// Maximum number of concurrent deliveries per tick.
    pub max_concurrent: usize,
    /// Whether dispatch is enabled.
    pub enabled: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DISPATCH_POLL_INTERVAL_SECS,
            window_slack_secs: DISPATCH_WINDOW_SLACK_SECS as i64,
            max_concurrent: DISPATCH_MAX_CONCURRENT,
            enabled: true,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DISPATCH_ENABLED` | `true` | Enable/disable outbound dispatch |
    /// | `DISPATCH_POLL_INTERVAL_SECS` | `60` | Polling interval |
    /// | `DISPATCH_WINDOW_SLACK_SECS` | `120` | Late-dispatch window |
    /// | `DISPATCH_MAX_CONCURRENT` | `4` | Max concurrent deliveries |
    pub fn from_env() -> Self {
        let enabled = std::env::var("DISPATCH_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_secs = std::env::var("DISPATCH_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DISPATCH_POLL_INTERVAL_SECS);

        let window_slack_secs = std::env::var("DISPATCH_WINDOW_SLACK_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DISPATCH_WINDOW_SLACK_SECS as i64);

        let max_concurrent = std::env::var("DISPATCH_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DISPATCH_MAX_CONCURRENT)
            .max(1);

        Self {
            poll_interval_secs,
            window_slack_secs,
            max_concurrent,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_window_slack(mut self, secs: i64) -> Self {
        self.window_slack_secs = secs;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the dispatcher.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Dispatcher started.
    Started,
    /// Dispatcher stopped.
    Stopped,
    /// A reminder occurrence was delivered.
    Delivered { reminder_id: Uuid },
    /// Delivery retries were exhausted for an occurrence.
    DeliveryFailed { reminder_id: Uuid, error: String },
}

/// Handle for controlling a running dispatcher.
pub struct DispatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<DispatchEvent>,
}

impl DispatcherHandle {
    /// Signal the dispatcher to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).await.map_err(|_| {
            cadence_core::Error::Internal("failed to send shutdown signal".into())
        })?;
        Ok(())
    }

    /// Get a receiver for dispatcher events.
    pub fn events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_rx.resubscribe()
    }
}

/// The outbound dispatcher.
pub struct Dispatcher {
    db: Database,
    gateway: Arc<dyn MessagingGateway>,
    config: DispatcherConfig,
    event_tx: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(db: Database, gateway: Arc<dyn MessagingGateway>, config: DispatcherConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            db,
            gateway,
            config,
            event_tx,
        }
    }

    /// Get a receiver for dispatcher events.
    pub fn events(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    /// Start the dispatcher and return a handle for control.
    pub fn start(self) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        DispatcherHandle {
            shutdown_tx,
            event_rx,
        }
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Dispatcher is disabled, not starting");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_concurrent = self.config.max_concurrent,
            "Dispatcher started"
        );
        let _ = self.event_tx.send(DispatchEvent::Started);

        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Dispatcher received shutdown signal");
                break;
            }

            let dispatched = match self.tick().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = ?e, "Dispatch tick failed");
                    0
                }
            };

            if dispatched == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Dispatcher received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
            // A non-empty tick polls again immediately: more reminders may
            // have come due while it was delivering.
        }

        let _ = self.event_tx.send(DispatchEvent::Stopped);
        info!("Dispatcher stopped");
    }

    /// Run one poll cycle: claim everything due and deliver concurrently.
    ///
    /// Returns the number of occurrences this tick won a claim for. Public so
    /// callers can drive dispatch without the polling loop.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        // The window reaches back one full poll interval plus slack, so a
        // late trigger still lists everything that came due since the
        // previous nominal tick.
        let window_start = now
            - chrono::Duration::seconds(self.config.poll_interval_secs as i64)
            - chrono::Duration::seconds(self.config.window_slack_secs);
        let due = self.db.reminders.list_due(window_start, now).await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "Found due reminders");

        let mut claimed = 0;
        let mut tasks = tokio::task::JoinSet::new();

        for reminder in due {
            let Some(observed_due) = reminder.next_due else {
                continue;
            };
            if !self.db.reminders.claim(reminder.id, observed_due, now).await? {
                debug!(reminder_id = %reminder.id, "Lost claim, skipping");
                continue;
            }
            claimed += 1;

            let dispatch = self.clone_refs();
            tasks.spawn(async move {
                dispatch.deliver(reminder, now).await;
            });

            // Cap in-flight deliveries.
            while tasks.len() >= self.config.max_concurrent {
                if let Some(Err(e)) = tasks.join_next().await {
                    error!(error = ?e, "Delivery task panicked");
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Delivery task panicked");
            }
        }

        Ok(claimed)
    }

    fn clone_refs(&self) -> DispatcherRef {
        DispatcherRef {
            db: self.db.clone(),
            gateway: self.gateway.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

/// Reference bundle for delivering a single claimed occurrence in a spawned
/// task.
struct DispatcherRef {
    db: Database,
    gateway: Arc<dyn MessagingGateway>,
    event_tx: broadcast::Sender<DispatchEvent>,
}

impl DispatcherRef {
    async fn deliver(self, reminder: Reminder, dispatched_at: DateTime<Utc>) {
        let start = Instant::now();
        let reminder_id = reminder.id;

        if let Err(e) = self.try_deliver(&reminder, dispatched_at).await {
            error!(
                reminder_id = %reminder_id,
                error = ?e,
                "Failed to record delivery state"
            );
        }

        debug!(
            reminder_id = %reminder_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Delivery finished"
        );
    }

    async fn try_deliver(&self, reminder: &Reminder, dispatched_at: DateTime<Utc>) -> Result<()> {
        let contact = self.db.contacts.fetch(reminder.contact_id).await?;

        if contact.status != ContactStatus::Confirmed {
            // The contact opted out or never confirmed after this reminder
            // was created. Advance the schedule without sending so the
            // occurrence does not spin in the due window forever.
            info!(
                reminder_id = %reminder.id,
                contact_status = contact.status.as_str(),
                "Skipping delivery to unconfirmed contact"
            );
            return self.advance_schedule(reminder, dispatched_at).await;
        }

        let body = reminder_body(reminder);
        match self.send_with_retries(&contact.phone, &body, reminder.id).await {
            Ok(()) => {
                self.advance_schedule(reminder, dispatched_at).await?;
                let _ = self.event_tx.send(DispatchEvent::Delivered {
                    reminder_id: reminder.id,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    reminder_id = %reminder.id,
                    error = %e,
                    "Delivery retries exhausted"
                );
                self.db.reminders.mark_send_failed(reminder.id).await?;
                self.db
                    .feed
                    .append(NewFeedEvent::send_failed(reminder, dispatched_at))
                    .await?;
                let _ = self.event_tx.send(DispatchEvent::DeliveryFailed {
                    reminder_id: reminder.id,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn send_with_retries(&self, to: &str, body: &str, reminder_id: Uuid) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            match self.gateway.send(to, body, &[]).await {
                Ok(receipt) => {
                    debug!(
                        reminder_id = %reminder_id,
                        message_id = %receipt.message_id,
                        attempt,
                        "Message sent"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(reminder_id = %reminder_id, attempt, error = %e, "Send attempt failed");
                    last_error = Some(e);
                    if attempt < SEND_MAX_ATTEMPTS {
                        sleep(Duration::from_millis(SEND_RETRY_BACKOFF_MS * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| cadence_core::Error::Gateway("no send attempts made".into())))
    }

    /// Advance `next_due` past the occurrence just handled. A one-time rule
    /// with nothing left transitions the reminder to completed.
    async fn advance_schedule(&self, reminder: &Reminder, dispatched_at: DateTime<Utc>) -> Result<()> {
        let reference = match reminder.next_due {
            Some(due) if due > dispatched_at => due,
            _ => dispatched_at,
        };
        let next = match next_occurrence(
            &reminder.rule,
            reminder.time_of_day,
            reminder.timezone,
            reference,
        )? {
            Occurrence::At(at) => Some(at),
            Occurrence::Exhausted => None,
        };
        self.db
            .reminders
            .reschedule(reminder.id, next, dispatched_at)
            .await
    }
}

/// The outbound message for a reminder occurrence.
fn reminder_body(reminder: &Reminder) -> String {
    let hint = match reminder.requirement {
        ResponseRequirement::Photo => "Reply with a photo when done.",
        ResponseRequirement::Text => "Reply when done.",
        ResponseRequirement::Either => "Reply (text or photo) when done.",
    };
    format!("Reminder: {}. {}", reminder.title, hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval_secs, DISPATCH_POLL_INTERVAL_SECS);
        assert_eq!(config.window_slack_secs, DISPATCH_WINDOW_SLACK_SECS as i64);
        assert_eq!(config.max_concurrent, DISPATCH_MAX_CONCURRENT);
        assert!(config.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::default()
            .with_poll_interval(5)
            .with_window_slack(30)
            .with_max_concurrent(8)
            .with_enabled(false);

        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.window_slack_secs, 30);
        assert_eq!(config.max_concurrent, 8);
        assert!(!config.enabled);
    }

    #[test]
    fn test_config_max_concurrent_floor() {
        let config = DispatcherConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, 1);
    }

    #[test]
    fn test_reminder_body_requirement_hint() {
        let mut reminder = sample_reminder();
        reminder.requirement = ResponseRequirement::Photo;
        assert!(reminder_body(&reminder).contains("photo"));

        reminder.requirement = ResponseRequirement::Text;
        let body = reminder_body(&reminder);
        assert!(body.starts_with("Reminder: take meds"));
    }

    fn sample_reminder() -> Reminder {
        Reminder {
            id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            title: "take meds".into(),
            rule: cadence_core::RecurrenceRule::Daily,
            time_of_day: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
            requirement: ResponseRequirement::Either,
            status: cadence_core::ReminderStatus::Active,
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
