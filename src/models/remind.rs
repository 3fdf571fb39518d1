//! Reminder and parent-wake registration models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Soft/hard reminder registration for a dispatched child session.
///
/// One per target; replaced on re-dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemindRegistration {
    /// Session being reminded.
    pub target_id: String,
    /// Session that dispatched the work, if any.
    pub parent_id: Option<String>,
    /// Seconds of silence before the important reminder.
    pub soft_threshold_s: u64,
    /// Seconds of silence before the urgent reminder.
    pub hard_threshold_s: u64,
    /// Last explicit status update (or registration time).
    pub last_reset_at: DateTime<Utc>,
    /// The soft reminder has fired since the last reset.
    pub soft_fired: bool,
    /// Registration is live.
    pub active: bool,
}

impl RemindRegistration {
    /// New registration starting its clock now.
    #[must_use]
    pub fn new(
        target_id: String,
        parent_id: Option<String>,
        soft_threshold_s: u64,
        hard_threshold_s: u64,
    ) -> Self {
        Self {
            target_id,
            parent_id,
            soft_threshold_s,
            hard_threshold_s,
            last_reset_at: Utc::now(),
            soft_fired: false,
            active: true,
        }
    }
}

/// Periodic wake-up registration pairing a dispatched child with its
/// parent. Persisted so wakes survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ParentWakeRegistration {
    /// Registration identifier.
    pub id: String,
    /// Child session under dispatch.
    pub child_id: String,
    /// Parent receiving the digests.
    pub parent_id: String,
    /// Wake period in seconds; halves on escalation.
    pub period_s: u64,
    /// When the registration was created.
    pub registered_at: DateTime<Utc>,
    /// Previous wake tick, if any.
    pub last_wake_at: Option<DateTime<Utc>>,
    /// Child's `agent_status_at` as seen at the previous wake.
    pub last_status_at_prev_wake: Option<DateTime<Utc>>,
    /// Escalation is one-way per registration.
    pub escalated: bool,
    /// Registration is live.
    pub active: bool,
}

impl ParentWakeRegistration {
    /// New registration with the default period.
    #[must_use]
    pub fn new(child_id: String, parent_id: String, period_s: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            child_id,
            parent_id,
            period_s,
            registered_at: Utc::now(),
            last_wake_at: None,
            last_status_at_prev_wake: None,
            escalated: false,
            active: true,
        }
    }
}
