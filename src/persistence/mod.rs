//! Persistence layer modules.

pub mod db;
pub mod queue_repo;
pub mod retention;
pub mod tool_events;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
