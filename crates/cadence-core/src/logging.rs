//! Structured logging field name constants for cadence.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation tools can query by standardized names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "store", "dispatch", "sync"
pub const SUBSYSTEM: &str = "subsystem";

/// Logical operation name.
/// Examples: "claim_due", "send", "correlate", "cascade_delete"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Account UUID in scope.
pub const ACCOUNT_ID: &str = "account_id";

/// Contact UUID being operated on.
pub const CONTACT_ID: &str = "contact_id";

/// Reminder UUID being operated on.
pub const REMINDER_ID: &str = "reminder_id";

/// Gateway-assigned inbound message id (idempotency key).
pub const GATEWAY_MESSAGE_ID: &str = "gateway_message_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Delivery attempt number within a retry loop.
pub const ATTEMPT: &str = "attempt";

/// Number of rows affected or records processed.
pub const ROW_COUNT: &str = "row_count";
