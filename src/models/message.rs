//! Queued message model and delivery modes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a message is injected into its target.
///
/// Modes differ in preemption and prompt prefix, not persistence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Deliver FIFO when the target is idle.
    #[default]
    Sequential,
    /// Same ordering as sequential with an attention prefix.
    Important,
    /// Cancel the current turn and deliver immediately.
    Urgent,
}

impl DeliveryMode {
    /// User-visible prefix applied at injection time.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sequential => "",
            Self::Important => "[important] ",
            Self::Urgent => "[URGENT] ",
        }
    }
}

/// Origin class of a queued message.
///
/// `ContextMonitor` is set only by the system for compaction and
/// context-usage notices; it is the sole key used to cancel those
/// without touching operator `send` traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageCategory {
    /// System-origin compaction/context-usage notification.
    ContextMonitor,
}

impl MessageCategory {
    /// Stable string form used in the queue database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContextMonitor => "context_monitor",
        }
    }

    /// Parse the database string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "context_monitor" => Some(Self::ContextMonitor),
            _ => None,
        }
    }
}

/// A message persisted in the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueuedMessage {
    /// Unique message identifier.
    pub id: String,
    /// Session this message is delivered to.
    pub target_id: String,
    /// Originating session, if any.
    pub sender_id: Option<String>,
    /// Parent session for wake-up pairing on dispatch messages.
    pub parent_id: Option<String>,
    /// Message body, already formatted for the agent.
    pub text: String,
    /// Injection mode.
    pub mode: DeliveryMode,
    /// Origin class; `None` for operator traffic.
    pub category: Option<MessageCategory>,
    /// Soft reminder threshold registered on delivery.
    pub remind_soft_s: Option<u64>,
    /// Hard reminder threshold registered on delivery.
    pub remind_hard_s: Option<u64>,
    /// Arm a stop notification back to the sender after delivery.
    pub notify_on_stop: bool,
    /// Enqueue timestamp; FIFO key within a mode.
    pub queued_at: DateTime<Utc>,
    /// Delivery timestamp; `None` while pending.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    /// Construct a pending message for a target.
    #[must_use]
    pub fn new(target_id: String, text: String, mode: DeliveryMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_id,
            sender_id: None,
            parent_id: None,
            text,
            mode,
            category: None,
            remind_soft_s: None,
            remind_hard_s: None,
            notify_on_stop: false,
            queued_at: Utc::now(),
            delivered_at: None,
        }
    }
}
