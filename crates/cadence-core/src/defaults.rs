//! Centralized default constants for the cadence system.
//!
//! **This module is the single source of truth** for all shared default values.
//! All crates should reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// DISPATCH
// =============================================================================

/// How often the dispatcher polls for due reminders (seconds).
///
/// The external trigger contract only guarantees "at least every N seconds,
/// at-least-once", so the claim path must tolerate overlapping ticks.
pub const DISPATCH_POLL_INTERVAL_SECS: u64 = 60;

/// Extra slack added behind the poll window so a late trigger never
/// drops a reminder that came due just before the previous tick.
pub const DISPATCH_WINDOW_SLACK_SECS: u64 = 120;

/// Maximum delivery attempts per occurrence before marking it failed-send.
pub const SEND_MAX_ATTEMPTS: u32 = 3;

/// Base backoff between delivery retries (milliseconds). Doubles per attempt.
pub const SEND_RETRY_BACKOFF_MS: u64 = 500;

/// Hard timeout per gateway send attempt (seconds).
pub const SEND_TIMEOUT_SECS: u64 = 10;

/// Maximum reminders claimed and sent concurrently in one tick.
pub const DISPATCH_MAX_CONCURRENT: usize = 4;

/// Age (seconds) after which an in-flight claim is considered abandoned
/// (dispatcher crashed mid-send) and becomes claimable again.
pub const CLAIM_STALE_SECS: u64 = 600;

// =============================================================================
// CORRELATION
// =============================================================================

/// How far back (hours) a dispatched occurrence remains eligible for
/// completion by an inbound reply.
pub const COMPLETION_LOOKBACK_HOURS: i64 = 24;

/// Maximum inbound body length retained verbatim; longer bodies are truncated
/// rather than rejected.
pub const MAX_RESPONSE_BODY_CHARS: usize = 4096;

/// Maximum media references kept per inbound message; extras are dropped.
pub const MAX_RESPONSE_MEDIA: usize = 10;

// =============================================================================
// SYNC
// =============================================================================

/// Broadcast capacity of the store event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Per-client-session buffered updates before the session is forced into
/// drop-and-resync.
pub const SESSION_BUFFER_SIZE: usize = 128;

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Rows deleted per batch during a cascade delete.
pub const CASCADE_BATCH_SIZE: i64 = 200;
