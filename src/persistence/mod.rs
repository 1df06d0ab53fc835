//! Persistence layer modules: the local durable queue and the remote record store.

pub mod db;
pub mod memory_queue;
pub mod memory_record;
pub mod queue_repo;
pub mod queue_store;
pub mod record_repo;
pub mod record_store;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
