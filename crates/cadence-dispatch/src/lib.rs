//! # cadence-dispatch
//!
//! Outbound reminder dispatch and inbound response correlation.
//!
//! The dispatcher polls the store for due reminders, claims each occurrence
//! through the store's compare-and-swap, and delivers over the messaging
//! gateway with bounded retries. The correlator is the other direction:
//! webhook-delivered replies are deduplicated, matched to contacts, and
//! applied to the enrollment handshake or an open reminder occurrence.
//!
//! Both sides assume at-least-once inputs (overlapping poll ticks,
//! redelivered webhooks) and converge on exactly-once effects.

pub mod correlator;
pub mod dispatcher;
pub mod gateway;

pub use correlator::ResponseCorrelator;
pub use dispatcher::{DispatchEvent, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use gateway::{
    GatewayReceipt, MessagingGateway, MockGateway, SentMessage, TwilioConfig, TwilioGateway,
};
