//! Per-target delivery state: idle flag, skip fence, ownership hints.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral per-target state reconciled by the idle tracker.
///
/// Created lazily on first use; destroyed with the session. Snapshotted
/// alongside the registry for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryState {
    /// Target session this state belongs to.
    pub session_id: String,
    /// Whether the target is at its input prompt.
    pub is_idle: bool,
    /// When the target last went idle.
    pub last_idle_at: Option<DateTime<Utc>>,
    /// When the target last showed activity.
    pub last_active_at: Option<DateTime<Utc>>,
    /// Stop hooks to absorb before treating a stop signal as genuine.
    pub stop_notify_skip_count: u32,
    /// When the skip fence was armed; cleared together with the count.
    pub skip_count_armed_at: Option<DateTime<Utc>>,
    /// Session awaiting a stop notification for this target.
    pub stop_notify_sender_id: Option<String>,
    /// Last target this session sent to; suppresses self-echo stop
    /// notifications.
    pub last_outgoing_send_target: Option<String>,
    /// Continuation path consumed by the next stop signal during handoff.
    pub pending_handoff_path: Option<PathBuf>,
    /// Last assistant response read from the transcript, for staleness
    /// detection on the next read.
    pub last_response: Option<String>,
}

impl DeliveryState {
    /// Fresh state for a target.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Whether the skip fence is currently armed.
    #[must_use]
    pub fn fence_armed(&self) -> bool {
        self.stop_notify_skip_count > 0 && self.skip_count_armed_at.is_some()
    }

    /// Clear both halves of the fence atomically.
    pub fn clear_fence(&mut self) {
        self.stop_notify_skip_count = 0;
        self.skip_count_armed_at = None;
    }
}
