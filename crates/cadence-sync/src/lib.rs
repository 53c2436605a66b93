//! # cadence-sync
//!
//! Deduplicated fan-out of store changes to connected clients.
//!
//! Each attached client gets a snapshot of its account, a resume backlog of
//! feed events it missed while disconnected, and then a live stream. Slow
//! clients never stall the store or other sessions: their queue drops
//! updates and they are told to resync.

pub mod coordinator;
pub mod session;

pub use coordinator::SyncCoordinator;
pub use session::{ClientSession, SyncUpdate};
