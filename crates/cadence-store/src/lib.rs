//! # cadence-store
//!
//! SQLite database layer for cadence.
//!
//! This crate provides:
//! - Connection pool management with embedded migrations
//! - Repository implementations for the account → contacts → {reminders,
//!   responses} hierarchy plus the feed event projection
//! - The dispatcher's claim compare-and-swap primitives
//! - Batched, idempotent cascade deletion
//!
//! Every committed mutation is published on the store's [`EventBus`], which
//! the sync coordinator subscribes to.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_core::{ContactRepository, EnrollContactRequest};
//! use cadence_store::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite://cadence.db").await?;
//!     let contact = db.contacts.upsert(EnrollContactRequest {
//!         account_id: uuid::Uuid::new_v4(),
//!         phone: "(555) 123-4567".into(),
//!         display_name: "Dana".into(),
//!     }).await?;
//!     println!("Enrolled {}", contact.id);
//!     Ok(())
//! }
//! ```

pub mod contacts;
pub mod feed;
pub mod lifecycle;
pub mod pool;
pub mod reminders;
pub mod responses;

// Test fixtures are always compiled so integration tests (in tests/) and
// downstream crates' suites can share them.
pub mod test_fixtures;

// Re-export core types
pub use cadence_core::*;

pub use contacts::SqliteContactRepository;
pub use feed::SqliteFeedEventRepository;
pub use lifecycle::{CascadeDeleter, CascadeStats};
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
pub use reminders::SqliteReminderRepository;
pub use responses::SqliteResponseRepository;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::SqlitePool,
    /// Change-feed bus every repository publishes to.
    pub bus: EventBus,
    /// Contact repository.
    pub contacts: SqliteContactRepository,
    /// Reminder repository (dispatch claim primitives included).
    pub reminders: SqliteReminderRepository,
    /// Response repository (inbound audit trail).
    pub responses: SqliteResponseRepository,
    /// Feed event repository (deduplicated projection).
    pub feed: SqliteFeedEventRepository,
    /// Cascade deleter for lifecycle management.
    pub lifecycle: CascadeDeleter,
}

impl Database {
    /// Create a Database from an existing pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        let bus = EventBus::default();
        Self {
            contacts: SqliteContactRepository::new(pool.clone(), bus.clone()),
            reminders: SqliteReminderRepository::new(pool.clone(), bus.clone()),
            responses: SqliteResponseRepository::new(pool.clone(), bus.clone()),
            feed: SqliteFeedEventRepository::new(pool.clone(), bus.clone()),
            lifecycle: CascadeDeleter::new(pool.clone(), bus.clone()),
            bus,
            pool,
        }
    }

    /// Connect, migrate, and build the full repository context.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Ok(Self::new(pool))
    }
}
