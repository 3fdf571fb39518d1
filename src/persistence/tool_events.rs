//! Tool-usage observability store.
//!
//! Written by hook handlers on every tool-use event; read by the
//! parent-wake digest assembler and the session introspection routes.
//! Lives in its own database file so dashboard reads never contend
//! with the delivery queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

use super::db::Database;

/// A single tool invocation observed via hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEvent {
    /// Session the tool ran in.
    pub session_id: String,
    /// Tool name as reported by the hook.
    pub tool_name: String,
    /// File the tool touched, when applicable.
    pub target_file: Option<String>,
    /// Shell command, for Bash-like tools.
    pub bash_command: Option<String>,
    /// Observation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Repository for the tool-event store.
#[derive(Clone)]
pub struct ToolEventRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ToolEventRow {
    session_id: String,
    tool_name: String,
    target_file: Option<String>,
    bash_command: Option<String>,
    created_at: String,
}

impl ToolEventRow {
    fn into_event(self) -> Result<ToolEvent> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        Ok(ToolEvent {
            session_id: self.session_id,
            tool_name: self.tool_name,
            target_file: self.target_file,
            bash_command: self.bash_command,
            created_at,
        })
    }
}

impl ToolEventRepo {
    /// Create the repository and ensure the table exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if schema application fails.
    pub async fn new(db: Arc<Database>) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL,
                 tool_name TEXT NOT NULL,
                 target_file TEXT,
                 bash_command TEXT,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(db.as_ref())
        .await?;
        Ok(Self { db })
    }

    /// Record a tool invocation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, event: &ToolEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_events (session_id, tool_name, target_file, bash_command, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&event.session_id)
        .bind(&event.tool_name)
        .bind(&event.target_file)
        .bind(&event.bash_command)
        .bind(event.created_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Most recent `limit` events for a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn last_for_session(&self, session_id: &str, limit: u32) -> Result<Vec<ToolEvent>> {
        let rows: Vec<ToolEventRow> = sqlx::query_as(
            "SELECT session_id, tool_name, target_file, bash_command, created_at
             FROM tool_events WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )
        .bind(session_id)
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(ToolEventRow::into_event).collect()
    }

    /// Purge events older than `before`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tool_events WHERE created_at < ?1")
            .bind(before.to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
