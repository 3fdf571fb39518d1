//! `SQLite` connection and schema bootstrap.
//!
//! Schema is applied idempotently on every startup. Columns added after
//! the first release are migrated with `ALTER TABLE` guarded by a
//! `PRAGMA table_info` presence check, so re-execution is safe.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::{AppError, Result};

/// Alias for the shared pool type.
pub type Database = SqlitePool;

/// Open (creating if needed) the message-queue database at `path` and
/// apply the schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
    }
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|err| AppError::Db(format!("invalid db path: {err}")))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Open an in-memory database for tests.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect_memory() -> Result<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Apply table definitions and pending column migrations.
async fn apply_schema(pool: &Database) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS message_queue (
             id TEXT PRIMARY KEY,
             target_id TEXT NOT NULL,
             sender_id TEXT,
             text TEXT NOT NULL,
             mode TEXT NOT NULL,
             queued_at TEXT NOT NULL,
             delivered_at TEXT
         )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS parent_wake_registrations (
             id TEXT PRIMARY KEY,
             child_id TEXT NOT NULL,
             parent_id TEXT NOT NULL,
             period_s INTEGER NOT NULL,
             registered_at TEXT NOT NULL,
             last_wake_at TEXT,
             last_status_at_prev_wake TEXT,
             escalated INTEGER NOT NULL DEFAULT 0,
             active INTEGER NOT NULL DEFAULT 1
         )",
    )
    .execute(pool)
    .await?;

    // Columns introduced after the initial queue schema.
    ensure_column(pool, "message_queue", "parent_id", "TEXT").await?;
    ensure_column(pool, "message_queue", "category", "TEXT").await?;
    ensure_column(pool, "message_queue", "remind_soft_s", "INTEGER").await?;
    ensure_column(pool, "message_queue", "remind_hard_s", "INTEGER").await?;
    ensure_column(
        pool,
        "message_queue",
        "notify_on_stop",
        "INTEGER NOT NULL DEFAULT 0",
    )
    .await?;

    Ok(())
}

/// Add `column` to `table` unless it already exists.
async fn ensure_column(pool: &Database, table: &str, column: &str, ddl: &str) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    let present = rows.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == column)
            .unwrap_or(false)
    });
    if !present {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}
