//! Delivery engine: the persistent message queue, per-target delivery
//! locks, and the three delivery modes.
//!
//! Injection is always two-phase — literal text, a settle interval,
//! then the submit key — because a combined "text + carriage return"
//! send trips the agent's paste-detection heuristic and the carriage
//! return is swallowed as a literal character. The atomicity that
//! matters is the per-target lock, not a single driver call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::driver::TerminalDriver;
use crate::models::message::{DeliveryMode, MessageCategory, QueuedMessage};
use crate::models::session::{Provider, Session, SessionStatus};
use crate::persistence::queue_repo::QueueRepo;
use crate::{AppError, Result};

use super::registry::SessionRegistry;
use super::reminders::ReminderScheduler;
use super::tracker::{prompt_shows_idle, IdleTracker, StopDisposition};

/// Parameters for enqueueing a message.
#[derive(Debug, Clone, Default)]
pub struct EnqueueRequest {
    /// Resolved target session id.
    pub target_id: String,
    /// Originating session, if any.
    pub sender_id: Option<String>,
    /// Parent session for wake-up pairing.
    pub parent_id: Option<String>,
    /// Message body.
    pub text: String,
    /// Injection mode.
    pub mode: DeliveryMode,
    /// Origin class; `None` for operator traffic.
    pub category: Option<MessageCategory>,
    /// Soft reminder threshold to register on delivery.
    pub remind_soft_s: Option<u64>,
    /// Hard reminder threshold to register on delivery.
    pub remind_hard_s: Option<u64>,
    /// Arm a stop notification back to the sender.
    pub notify_on_stop: bool,
}

/// The message queue plus everything needed to drain it into panes.
pub struct DeliveryEngine {
    registry: Arc<SessionRegistry>,
    tracker: Arc<IdleTracker>,
    queue: QueueRepo,
    driver: Arc<dyn TerminalDriver>,
    scheduler: Arc<ReminderScheduler>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    settle: Duration,
    urgent_prompt_timeout: Duration,
    urgent_poll_interval: Duration,
    handoff_dir: PathBuf,
}

impl DeliveryEngine {
    /// Assemble the engine.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Wiring, not public API width.
    pub fn new(
        registry: Arc<SessionRegistry>,
        tracker: Arc<IdleTracker>,
        queue: QueueRepo,
        driver: Arc<dyn TerminalDriver>,
        scheduler: Arc<ReminderScheduler>,
        settle: Duration,
        urgent_prompt_timeout: Duration,
        urgent_poll_interval: Duration,
        handoff_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            tracker,
            queue,
            driver,
            scheduler,
            locks: Mutex::new(HashMap::new()),
            settle,
            urgent_prompt_timeout,
            urgent_poll_interval,
            handoff_dir,
        }
    }

    /// The idle tracker this engine consults.
    #[must_use]
    pub fn tracker(&self) -> &Arc<IdleTracker> {
        &self.tracker
    }

    /// The reminder scheduler fed by dispatch deliveries.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        &self.scheduler
    }

    /// The delivery lock for a target, created lazily.
    ///
    /// Held for the full duration of one injection (cancel + settle +
    /// text + submit); both the urgent path and idle flushes take it,
    /// as does the handoff coordinator.
    pub async fn target_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Enqueue a message for delivery.
    ///
    /// Sequential and important messages wait for the target to go
    /// idle; urgent messages preempt. The row is durable before any
    /// injection is attempted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown targets and
    /// `AppError::InvalidState` for stopped ones. An urgent delivery
    /// failure is surfaced to the caller; the row stays queued for
    /// sequential retry.
    pub async fn enqueue(self: &Arc<Self>, request: EnqueueRequest) -> Result<QueuedMessage> {
        let session = self
            .registry
            .get(&request.target_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {}", request.target_id)))?;
        if session.status == SessionStatus::Stopped {
            return Err(AppError::InvalidState(format!(
                "session {} is stopped",
                session.id
            )));
        }

        let mut msg = QueuedMessage::new(request.target_id.clone(), request.text, request.mode);
        msg.sender_id = request.sender_id.clone();
        msg.parent_id = request.parent_id;
        msg.category = request.category;
        msg.remind_soft_s = request.remind_soft_s;
        msg.remind_hard_s = request.remind_hard_s;
        msg.notify_on_stop = request.notify_on_stop;
        let msg = self.queue.insert(&msg).await?;

        if let Some(ref sender) = request.sender_id {
            self.tracker
                .note_outgoing_send(sender, &request.target_id)
                .await;
            if request.notify_on_stop {
                self.tracker
                    .arm_stop_notify(&request.target_id, sender)
                    .await;
            }
        }

        match request.mode {
            DeliveryMode::Urgent => {
                self.tracker.mark_active(&request.target_id).await;
                self.deliver_urgent(&msg).await?;
            }
            DeliveryMode::Sequential | DeliveryMode::Important => {
                if self.tracker.is_idle(&request.target_id).await {
                    let engine = Arc::clone(self);
                    let target = request.target_id.clone();
                    tokio::spawn(async move {
                        engine.flush_target(&target, false).await;
                    });
                }
            }
        }

        Ok(msg)
    }

    /// Urgent path: lock, cancel key, poll for the input prompt, then
    /// deliver — and drain the rest of the queue in the same lock hold
    /// so an interleaved idle flush cannot reorder anything.
    async fn deliver_urgent(self: &Arc<Self>, msg: &QueuedMessage) -> Result<()> {
        let lock = self.target_lock(&msg.target_id).await;
        let _guard = lock.lock().await;

        let session = self
            .registry
            .get(&msg.target_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {}", msg.target_id)))?;
        let pane = session.pane_ref().to_owned();

        self.driver.send_cancel_key(&pane).await?;
        self.wait_for_prompt(&session, &pane).await;
        self.deliver_one(&session, msg).await?;

        // Anything queued behind the urgent message rides along.
        self.drain_pending(&session).await;
        Ok(())
    }

    /// Poll the pane until the provider's input prompt is visible or the
    /// urgent window elapses. Best-effort: a capture failure or timeout
    /// falls through to the injection attempt.
    async fn wait_for_prompt(&self, session: &Session, pane: &str) {
        let Some(glyph) = session.provider.prompt_glyph() else {
            return;
        };
        let deadline = tokio::time::Instant::now() + self.urgent_prompt_timeout;
        while tokio::time::Instant::now() < deadline {
            match self.driver.capture_pane(pane, false).await {
                Ok(capture) if prompt_shows_idle(&capture, glyph) => return,
                Ok(_) => {}
                Err(err) => {
                    debug!(session_id = %session.id, %err, "prompt poll capture failed");
                }
            }
            tokio::time::sleep(self.urgent_poll_interval).await;
        }
        warn!(session_id = %session.id, "prompt did not settle before urgent delivery");
    }

    /// Flush pending messages for a target FIFO while holding its lock.
    ///
    /// `force` skips the tracker idle check (used for the handoff wake,
    /// where the fence deliberately keeps `is_idle` false); the visible
    /// prompt-glyph guard still applies for Claude panes, so a stale
    /// idle flag can never interrupt a mid-turn agent.
    pub async fn flush_target(self: &Arc<Self>, target_id: &str, force: bool) {
        let lock = self.target_lock(target_id).await;
        let _guard = lock.lock().await;

        if !force && !self.tracker.is_idle(target_id).await {
            return;
        }
        let Some(session) = self.registry.get(target_id).await else {
            return;
        };
        if session.status == SessionStatus::Stopped {
            return;
        }

        // Stale-idle guard: re-verify the prompt before trusting a flag
        // set by an old stop hook.
        if session.provider == Provider::ClaudeTmux {
            let pane = session.pane_ref();
            match self.driver.capture_pane(pane, false).await {
                Ok(capture) => {
                    let glyph = session.provider.prompt_glyph().unwrap_or(">");
                    if !prompt_shows_idle(&capture, glyph) {
                        debug!(target_id, "prompt not visible, deferring flush");
                        return;
                    }
                }
                Err(err) => {
                    warn!(target_id, %err, "capture failed, deferring flush");
                    return;
                }
            }
        }

        self.drain_pending(&session).await;
    }

    /// Deliver every pending message for `session` in FIFO order. Stops
    /// at the first failure, leaving the remainder queued.
    async fn drain_pending(self: &Arc<Self>, session: &Session) {
        let pending = match self.queue.pending_for_target(&session.id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(target_id = %session.id, %err, "failed to read pending messages");
                return;
            }
        };
        for msg in pending {
            if let Err(err) = self.deliver_one(session, &msg).await {
                warn!(target_id = %session.id, message_id = %msg.id, %err,
                    "delivery failed, leaving message queued");
                break;
            }
        }
    }

    /// Two-phase injection of a single message plus post-delivery
    /// bookkeeping: delivered stamp, activity marking, reminder and
    /// parent-wake registration.
    async fn deliver_one(self: &Arc<Self>, session: &Session, msg: &QueuedMessage) -> Result<()> {
        let pane = session.pane_ref();
        let text = format!("{}{}", msg.mode.prefix(), msg.text);

        self.inject_two_phase(pane, &text).await?;
        self.queue.mark_delivered(&msg.id, Utc::now()).await?;

        let queued_for = (Utc::now() - msg.queued_at).num_seconds();
        info!(target_id = %session.id, message_id = %msg.id, mode = ?msg.mode, queued_for,
            "message delivered");

        self.tracker.mark_active(&session.id).await;
        if let Err(err) = self
            .registry
            .update_status(&session.id, SessionStatus::Running)
            .await
        {
            debug!(target_id = %session.id, %err, "status update after delivery skipped");
        }

        if msg.remind_soft_s.is_some() || msg.remind_hard_s.is_some() {
            self.scheduler
                .register_remind(
                    &session.id,
                    msg.parent_id.clone(),
                    msg.remind_soft_s,
                    msg.remind_hard_s,
                )
                .await;
        }
        if let Some(ref parent_id) = msg.parent_id {
            self.scheduler
                .register_parent_wake(&session.id, parent_id)
                .await;
        }
        Ok(())
    }

    /// The two-phase injection contract: literal text, settle, submit.
    /// Each driver call fails independently; both failures leave the
    /// message queued for retry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Driver` when either driver call fails.
    pub async fn inject_two_phase(&self, pane: &str, text: &str) -> Result<()> {
        self.driver.send_literal_text(pane, text).await?;
        tokio::time::sleep(self.settle).await;
        self.driver.send_submit_key(pane).await?;
        Ok(())
    }

    /// Route a stop-class hook signal: fence absorption, the pending
    /// handoff branch, or a genuine idle transition with notification
    /// and flush.
    pub async fn handle_stop_signal(
        self: &Arc<Self>,
        session_id: &str,
        transcript_path: Option<&str>,
    ) {
        match self.tracker.apply_stop_signal(session_id).await {
            StopDisposition::Absorbed => {
                // A late clear hook must not downgrade the re-primed
                // session, so status stays untouched here.
            }
            StopDisposition::HandoffWake(continuation) => {
                self.enqueue_handoff_wake(session_id, &continuation).await;
            }
            StopDisposition::Idle => {
                if let Err(err) = self
                    .registry
                    .update_status(session_id, SessionStatus::Idle)
                    .await
                {
                    debug!(session_id, %err, "idle status update skipped");
                }
                self.scheduler.cancel_remind(session_id).await;
                self.scheduler.cancel_parent_wake(session_id).await;
                self.send_stop_notification(session_id, transcript_path)
                    .await;

                let engine = Arc::clone(self);
                let target = session_id.to_owned();
                tokio::spawn(async move {
                    engine.flush_target(&target, false).await;
                });
            }
        }
    }

    /// Queue the handoff wake message and force-flush it: the fence
    /// keeps `is_idle` false on purpose, but the pane is at its prompt
    /// right after `/clear`, which the prompt guard verifies.
    async fn enqueue_handoff_wake(self: &Arc<Self>, session_id: &str, continuation: &std::path::Path) {
        let text = self.compose_handoff_wake(session_id, continuation).await;
        let request = EnqueueRequest {
            target_id: session_id.to_owned(),
            text,
            mode: DeliveryMode::Important,
            ..EnqueueRequest::default()
        };
        if let Err(err) = self.enqueue(request).await {
            warn!(session_id, %err, "failed to queue handoff wake message");
            return;
        }
        let engine = Arc::clone(self);
        let target = session_id.to_owned();
        tokio::spawn(async move {
            engine.flush_target(&target, true).await;
        });
    }

    /// Build the wake message referencing the continuation file, the
    /// always-on pipe log, and the scrollback dump when one was captured.
    async fn compose_handoff_wake(&self, session_id: &str, continuation: &std::path::Path) -> String {
        let mut text = format!(
            "Context was reset. Resume the task from {}.",
            continuation.display()
        );
        if let Some(session) = self.registry.get(session_id).await {
            if !session.log_file.is_empty() {
                text.push_str(&format!(" Full pane log: {}.", session.log_file));
            }
        }
        if let Some(dump) = latest_handoff_dump(&self.handoff_dir, session_id) {
            text.push_str(&format!(" Scrollback snapshot: {}.", dump.display()));
        }
        text
    }

    /// Emit the armed stop notification for a target, if any, back to
    /// the sender that requested it.
    async fn send_stop_notification(self: &Arc<Self>, session_id: &str, transcript: Option<&str>) {
        let Some(sender_id) = self.tracker.take_stop_notify(session_id).await else {
            return;
        };
        // Self-echo: the target's own last send went to this sender, so
        // this stop is the tail of that exchange, not a completion.
        let echo = self
            .tracker
            .state(session_id)
            .await
            .and_then(|s| s.last_outgoing_send_target)
            .is_some_and(|t| t == sender_id);
        if echo {
            debug!(session_id, sender_id, "suppressing self-echo stop notification");
            return;
        }

        let name = self
            .registry
            .get(session_id)
            .await
            .map_or_else(|| session_id.to_owned(), |s| s.display_name().to_owned());

        let response = match transcript {
            Some(path) => {
                self.tracker
                    .last_response_with_retries(session_id, path)
                    .await
            }
            None => None,
        };

        let mut text = format!("{name} went idle.");
        if let Some(response) = response {
            let tail: String = response.chars().take(400).collect();
            text.push_str(&format!(" Last response: {tail}"));
        }

        let request = EnqueueRequest {
            target_id: sender_id.clone(),
            sender_id: Some(session_id.to_owned()),
            text,
            mode: DeliveryMode::Sequential,
            ..EnqueueRequest::default()
        };
        if let Err(err) = self.enqueue(request).await {
            warn!(session_id, sender_id, %err, "failed to queue stop notification");
        }
    }

    /// Delete undelivered context-monitor messages from a sender,
    /// leaving operator traffic untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cancel_context_monitor_from(&self, sender_id: &str) -> Result<u64> {
        let count = self.queue.cancel_context_monitor_from(sender_id).await?;
        if count > 0 {
            info!(sender_id, count, "cancelled stale context-monitor messages");
        }
        Ok(count)
    }

    /// Number of undelivered messages for a target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_count(&self, target_id: &str) -> Result<u64> {
        self.queue.pending_count(target_id).await
    }

    /// Drop all undelivered messages for a killed target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn discard_pending(&self, target_id: &str) -> Result<u64> {
        self.queue.discard_pending_for_target(target_id).await
    }

    /// Crash recovery: undelivered rows with a live target wait for the
    /// next idle signal; rows whose target no longer exists are dropped
    /// and logged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the queue scan fails.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        for target_id in self.queue.pending_targets().await? {
            match self.registry.get(&target_id).await {
                Some(session) if session.status != SessionStatus::Stopped => {
                    debug!(target_id, "pending messages await next idle signal");
                }
                _ => {
                    let dropped = self.queue.discard_pending_for_target(&target_id).await?;
                    warn!(target_id, dropped, "discarded messages for missing target");
                }
            }
        }
        Ok(())
    }
}

/// Most recent scrollback dump written for a session, if any.
fn latest_handoff_dump(handoff_dir: &std::path::Path, session_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(handoff_dir).ok()?;
    let prefix = format!("{session_id}-");
    entries
        .filter_map(std::result::Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(prefix.as_str())
        })
        .map(|entry| entry.path().join("dump.txt"))
        .filter(|path| path.exists())
        .max()
}
