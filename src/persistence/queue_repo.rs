//! Message queue and parent-wake repositories for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::message::{DeliveryMode, MessageCategory, QueuedMessage};
use crate::models::remind::ParentWakeRegistration;
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for queued messages.
#[derive(Clone)]
pub struct QueueRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    target_id: String,
    sender_id: Option<String>,
    parent_id: Option<String>,
    text: String,
    mode: String,
    category: Option<String>,
    remind_soft_s: Option<i64>,
    remind_hard_s: Option<i64>,
    notify_on_stop: i64,
    queued_at: String,
    delivered_at: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> Result<QueuedMessage> {
        let mode = parse_mode(&self.mode)?;
        let category = self
            .category
            .as_deref()
            .map(|s| {
                MessageCategory::parse(s)
                    .ok_or_else(|| AppError::Db(format!("invalid message category: {s}")))
            })
            .transpose()?;
        Ok(QueuedMessage {
            id: self.id,
            target_id: self.target_id,
            sender_id: self.sender_id,
            parent_id: self.parent_id,
            text: self.text,
            mode,
            category,
            remind_soft_s: self.remind_soft_s.map(|v| v.unsigned_abs()),
            remind_hard_s: self.remind_hard_s.map(|v| v.unsigned_abs()),
            notify_on_stop: self.notify_on_stop != 0,
            queued_at: parse_ts(&self.queued_at)?,
            delivered_at: self.delivered_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp: {e}")))
}

fn parse_mode(s: &str) -> Result<DeliveryMode> {
    match s {
        "sequential" => Ok(DeliveryMode::Sequential),
        "important" => Ok(DeliveryMode::Important),
        "urgent" => Ok(DeliveryMode::Urgent),
        other => Err(AppError::Db(format!("invalid delivery mode: {other}"))),
    }
}

fn mode_str(mode: DeliveryMode) -> &'static str {
    match mode {
        DeliveryMode::Sequential => "sequential",
        DeliveryMode::Important => "important",
        DeliveryMode::Urgent => "urgent",
    }
}

const SELECT_COLUMNS: &str = "id, target_id, sender_id, parent_id, text, mode, category, \
     remind_soft_s, remind_hard_s, notify_on_stop, queued_at, delivered_at";

impl QueueRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new pending message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, msg: &QueuedMessage) -> Result<QueuedMessage> {
        sqlx::query(
            "INSERT INTO message_queue (id, target_id, sender_id, parent_id, text, mode,
             category, remind_soft_s, remind_hard_s, notify_on_stop, queued_at, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&msg.id)
        .bind(&msg.target_id)
        .bind(&msg.sender_id)
        .bind(&msg.parent_id)
        .bind(&msg.text)
        .bind(mode_str(msg.mode))
        .bind(msg.category.map(MessageCategory::as_str))
        .bind(msg.remind_soft_s.map(|v| v as i64))
        .bind(msg.remind_hard_s.map(|v| v as i64))
        .bind(i64::from(msg.notify_on_stop))
        .bind(msg.queued_at.to_rfc3339())
        .bind(msg.delivered_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;
        Ok(msg.clone())
    }

    /// Fetch undelivered messages for a target, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_for_target(&self, target_id: &str) -> Result<Vec<QueuedMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM message_queue
             WHERE target_id = ?1 AND delivered_at IS NULL
             ORDER BY queued_at ASC, id ASC",
        ))
        .bind(target_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Count undelivered messages for a target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_count(&self, target_id: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM message_queue WHERE target_id = ?1 AND delivered_at IS NULL",
        )
        .bind(target_id)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(row.0.unsigned_abs())
    }

    /// Distinct targets with undelivered messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_targets(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT target_id FROM message_queue WHERE delivered_at IS NULL",
        )
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    /// Stamp a message delivered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_delivered(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE message_queue SET delivered_at = ?1 WHERE id = ?2")
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Delete undelivered context-monitor messages from a sender.
    ///
    /// Rows with a NULL category (operator traffic) are never touched.
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cancel_context_monitor_from(&self, sender_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_queue
             WHERE sender_id = ?1 AND category = ?2 AND delivered_at IS NULL",
        )
        .bind(sender_id)
        .bind(MessageCategory::ContextMonitor.as_str())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete all undelivered messages for a target (session killed or
    /// missing after restart). Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn discard_pending_for_target(&self, target_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_queue WHERE target_id = ?1 AND delivered_at IS NULL",
        )
        .bind(target_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }

    /// Purge delivered messages older than `before`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_delivered(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_queue WHERE delivered_at IS NOT NULL AND delivered_at < ?1",
        )
        .bind(before.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Internal row struct for wake registrations.
#[derive(sqlx::FromRow)]
struct WakeRow {
    id: String,
    child_id: String,
    parent_id: String,
    period_s: i64,
    registered_at: String,
    last_wake_at: Option<String>,
    last_status_at_prev_wake: Option<String>,
    escalated: i64,
    active: i64,
}

impl WakeRow {
    fn into_registration(self) -> Result<ParentWakeRegistration> {
        Ok(ParentWakeRegistration {
            id: self.id,
            child_id: self.child_id,
            parent_id: self.parent_id,
            period_s: self.period_s.unsigned_abs(),
            registered_at: parse_ts(&self.registered_at)?,
            last_wake_at: self.last_wake_at.as_deref().map(parse_ts).transpose()?,
            last_status_at_prev_wake: self
                .last_status_at_prev_wake
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            escalated: self.escalated != 0,
            active: self.active != 0,
        })
    }
}

/// Repository for persisted parent-wake registrations.
#[derive(Clone)]
pub struct WakeRepo {
    db: Arc<Database>,
}

impl WakeRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the registration for a child.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn upsert(&self, reg: &ParentWakeRegistration) -> Result<()> {
        sqlx::query("DELETE FROM parent_wake_registrations WHERE child_id = ?1")
            .bind(&reg.child_id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query(
            "INSERT INTO parent_wake_registrations
             (id, child_id, parent_id, period_s, registered_at, last_wake_at,
              last_status_at_prev_wake, escalated, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&reg.id)
        .bind(&reg.child_id)
        .bind(&reg.parent_id)
        .bind(reg.period_s as i64)
        .bind(reg.registered_at.to_rfc3339())
        .bind(reg.last_wake_at.map(|dt| dt.to_rfc3339()))
        .bind(reg.last_status_at_prev_wake.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(reg.escalated))
        .bind(i64::from(reg.active))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Update the tick bookkeeping fields after a wake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn record_wake(&self, reg: &ParentWakeRegistration) -> Result<()> {
        sqlx::query(
            "UPDATE parent_wake_registrations
             SET period_s = ?1, last_wake_at = ?2, last_status_at_prev_wake = ?3, escalated = ?4
             WHERE id = ?5",
        )
        .bind(reg.period_s as i64)
        .bind(reg.last_wake_at.map(|dt| dt.to_rfc3339()))
        .bind(reg.last_status_at_prev_wake.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(reg.escalated))
        .bind(&reg.id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Mark the registration for a child inactive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn deactivate(&self, child_id: &str) -> Result<()> {
        sqlx::query("UPDATE parent_wake_registrations SET active = 0 WHERE child_id = ?1")
            .bind(child_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Fetch all active registrations (startup recovery).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_active(&self) -> Result<Vec<ParentWakeRegistration>> {
        let rows: Vec<WakeRow> =
            sqlx::query_as("SELECT * FROM parent_wake_registrations WHERE active = 1")
                .fetch_all(self.db.as_ref())
                .await?;
        rows.into_iter().map(WakeRow::into_registration).collect()
    }
}
