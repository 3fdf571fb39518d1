//! Reminder scheduler: per-target soft/hard reminders and parent
//! wake-up digests.
//!
//! Each registration runs as its own background timer task controlled
//! by a `CancellationToken`. Tasks never touch the delivery engine
//! directly; they emit [`ReminderEvent`]s over an `mpsc` channel and a
//! consumer task turns those into queued messages. That keeps the
//! dependency graph acyclic: scheduler → channel → consumer → engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemindConfig;
use crate::models::message::DeliveryMode;
use crate::models::remind::{ParentWakeRegistration, RemindRegistration};
use crate::models::session::SessionStatus;
use crate::persistence::queue_repo::WakeRepo;
use crate::persistence::tool_events::ToolEventRepo;

use super::delivery::{DeliveryEngine, EnqueueRequest};
use super::registry::SessionRegistry;

/// Events emitted by reminder and wake timers for consumer handling.
#[derive(Debug, Clone)]
pub enum ReminderEvent {
    /// Soft threshold crossed without a status update.
    SoftRemind {
        /// Session being reminded.
        target_id: String,
        /// Seconds since the last reset.
        silent_for_s: u64,
    },
    /// Hard threshold crossed; reminder preempts.
    HardRemind {
        /// Session being reminded.
        target_id: String,
        /// Seconds since the last reset.
        silent_for_s: u64,
    },
    /// Periodic digest for the parent of a dispatched child.
    ParentWake {
        /// Parent session receiving the digest.
        parent_id: String,
        /// Child the digest describes.
        child_id: String,
        /// Assembled digest text.
        digest: String,
    },
}

struct RemindEntry {
    reg: Arc<Mutex<RemindRegistration>>,
    cancel: CancellationToken,
}

struct WakeEntry {
    cancel: CancellationToken,
}

/// Owner of all reminder and wake registrations.
pub struct ReminderScheduler {
    registry: Arc<SessionRegistry>,
    tool_events: ToolEventRepo,
    wake_repo: WakeRepo,
    event_tx: mpsc::Sender<ReminderEvent>,
    reminds: Mutex<HashMap<String, RemindEntry>>,
    wakes: Mutex<HashMap<String, WakeEntry>>,
    config: RemindConfig,
    root_cancel: CancellationToken,
}

impl ReminderScheduler {
    /// Build the scheduler. Timer tasks are children of `root_cancel`.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        tool_events: ToolEventRepo,
        wake_repo: WakeRepo,
        event_tx: mpsc::Sender<ReminderEvent>,
        config: RemindConfig,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            tool_events,
            wake_repo,
            event_tx,
            reminds: Mutex::new(HashMap::new()),
            wakes: Mutex::new(HashMap::new()),
            config,
            root_cancel,
        }
    }

    /// Register (or replace) the soft/hard reminder for a target.
    /// Missing thresholds fall back to the configured defaults.
    pub async fn register_remind(
        &self,
        target_id: &str,
        parent_id: Option<String>,
        soft_s: Option<u64>,
        hard_s: Option<u64>,
    ) {
        let soft = soft_s.unwrap_or(self.config.soft_threshold_s);
        let hard = hard_s.unwrap_or(self.config.hard_threshold_s).max(soft + 1);
        let registration =
            RemindRegistration::new(target_id.to_owned(), parent_id, soft, hard);
        let reg = Arc::new(Mutex::new(registration));
        let cancel = self.root_cancel.child_token();

        let mut reminds = self.reminds.lock().await;
        if let Some(old) = reminds.insert(
            target_id.to_owned(),
            RemindEntry {
                reg: Arc::clone(&reg),
                cancel: cancel.clone(),
            },
        ) {
            old.cancel.cancel();
        }
        drop(reminds);

        info!(target_id, soft, hard, "reminder registered");
        tokio::spawn(run_remind_timer(
            Arc::clone(&self.registry),
            reg,
            self.event_tx.clone(),
            self.config.clone(),
            cancel,
        ));
    }

    /// Cancel the reminder for a target, if one is registered.
    pub async fn cancel_remind(&self, target_id: &str) {
        if let Some(entry) = self.reminds.lock().await.remove(target_id) {
            entry.cancel.cancel();
            debug!(target_id, "reminder cancelled");
        }
    }

    /// Reset the reminder clock after an explicit agent status update.
    /// A prior soft trigger is rescheduled.
    pub async fn agent_status_update(&self, target_id: &str) {
        if let Some(entry) = self.reminds.lock().await.get(target_id) {
            let mut reg = entry.reg.lock().await;
            reg.last_reset_at = Utc::now();
            reg.soft_fired = false;
            debug!(target_id, "reminder clock reset");
        }
    }

    /// Register (or replace) the parent wake for a dispatched child.
    pub async fn register_parent_wake(&self, child_id: &str, parent_id: &str) {
        let registration = ParentWakeRegistration::new(
            child_id.to_owned(),
            parent_id.to_owned(),
            self.config.wake_period_s,
        );
        if let Err(err) = self.wake_repo.upsert(&registration).await {
            warn!(child_id, %err, "failed to persist wake registration");
        }
        self.spawn_wake(registration).await;
        info!(child_id, parent_id, "parent wake registered");
    }

    /// Cancel the parent wake for a child, marking it inactive on disk.
    pub async fn cancel_parent_wake(&self, child_id: &str) {
        if let Some(entry) = self.wakes.lock().await.remove(child_id) {
            entry.cancel.cancel();
            debug!(child_id, "parent wake cancelled");
        }
        if let Err(err) = self.wake_repo.deactivate(child_id).await {
            warn!(child_id, %err, "failed to deactivate wake registration");
        }
    }

    /// Whether a wake registration is currently live for a child.
    pub async fn has_parent_wake(&self, child_id: &str) -> bool {
        self.wakes.lock().await.contains_key(child_id)
    }

    /// Restore persisted wake registrations after a restart. Entries
    /// whose child session is gone are deactivated instead.
    pub async fn recover_parent_wakes(&self) {
        let registrations = match self.wake_repo.list_active().await {
            Ok(regs) => regs,
            Err(err) => {
                warn!(%err, "failed to read wake registrations for recovery");
                return;
            }
        };
        for registration in registrations {
            let live = self
                .registry
                .get(&registration.child_id)
                .await
                .is_some_and(|s| s.status != SessionStatus::Stopped);
            if live {
                info!(child_id = %registration.child_id, "recovered parent wake");
                self.spawn_wake(registration).await;
            } else {
                let _ = self.wake_repo.deactivate(&registration.child_id).await;
            }
        }
    }

    async fn spawn_wake(&self, registration: ParentWakeRegistration) {
        let child_id = registration.child_id.clone();
        let reg = Arc::new(Mutex::new(registration));
        let cancel = self.root_cancel.child_token();

        let mut wakes = self.wakes.lock().await;
        if let Some(old) = wakes.insert(
            child_id,
            WakeEntry {
                cancel: cancel.clone(),
            },
        ) {
            old.cancel.cancel();
        }
        drop(wakes);

        tokio::spawn(run_wake_timer(
            Arc::clone(&self.registry),
            self.tool_events.clone(),
            self.wake_repo.clone(),
            reg,
            self.event_tx.clone(),
            self.config.clone(),
            cancel,
        ));
    }
}

/// Core soft/hard reminder loop for one target.
async fn run_remind_timer(
    registry: Arc<SessionRegistry>,
    reg: Arc<Mutex<RemindRegistration>>,
    event_tx: mpsc::Sender<ReminderEvent>,
    config: RemindConfig,
    cancel: CancellationToken,
) {
    let poll = Duration::from_secs(config.poll_interval_s.max(1));
    let target_id = reg.lock().await.target_id.clone();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target_id, "remind timer cancelled");
                return;
            }
            () = tokio::time::sleep(poll) => {}
        }

        let Some(session) = registry.get(&target_id).await else {
            return;
        };
        if session.status == SessionStatus::Stopped {
            return;
        }
        // Reminding a compacting agent would trigger a secondary
        // compaction, so the periodic tick skips entirely.
        if session.is_compacting {
            continue;
        }

        let (elapsed, soft, hard, soft_fired) = {
            let reg = reg.lock().await;
            (
                (Utc::now() - reg.last_reset_at).num_seconds().max(0) as u64,
                reg.soft_threshold_s,
                reg.hard_threshold_s,
                reg.soft_fired,
            )
        };

        if elapsed >= hard {
            wait_out_compaction(&registry, &target_id, &config, &cancel).await;
            let _ = event_tx
                .send(ReminderEvent::HardRemind {
                    target_id: target_id.clone(),
                    silent_for_s: elapsed,
                })
                .await;
            info!(target_id, elapsed, "hard reminder fired");
            return;
        }

        if !soft_fired && elapsed >= soft {
            reg.lock().await.soft_fired = true;
            wait_out_compaction(&registry, &target_id, &config, &cancel).await;
            let _ = event_tx
                .send(ReminderEvent::SoftRemind {
                    target_id: target_id.clone(),
                    silent_for_s: elapsed,
                })
                .await;
            info!(target_id, elapsed, "soft reminder fired");
        }
    }
}

/// One-shot delivery interlock: wait out an in-progress compaction,
/// bounded by the configured ceiling. On ceiling, deliver anyway.
async fn wait_out_compaction(
    registry: &Arc<SessionRegistry>,
    target_id: &str,
    config: &RemindConfig,
    cancel: &CancellationToken,
) {
    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(config.compaction_wait_ceiling_s);
    loop {
        let compacting = registry
            .get(target_id)
            .await
            .is_some_and(|s| s.is_compacting);
        if !compacting {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(target_id, "compaction wait ceiling reached, delivering reminder anyway");
            return;
        }
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

/// Periodic parent wake-up loop for one child.
async fn run_wake_timer(
    registry: Arc<SessionRegistry>,
    tool_events: ToolEventRepo,
    wake_repo: WakeRepo,
    reg: Arc<Mutex<ParentWakeRegistration>>,
    event_tx: mpsc::Sender<ReminderEvent>,
    config: RemindConfig,
    cancel: CancellationToken,
) {
    let (child_id, parent_id) = {
        let reg = reg.lock().await;
        (reg.child_id.clone(), reg.parent_id.clone())
    };

    loop {
        let period = Duration::from_secs(reg.lock().await.period_s.max(1));
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(child_id, "wake timer cancelled");
                return;
            }
            () = tokio::time::sleep(period) => {}
        }

        let Some(child) = registry.get(&child_id).await else {
            let _ = wake_repo.deactivate(&child_id).await;
            return;
        };
        if child.status == SessionStatus::Stopped {
            let _ = wake_repo.deactivate(&child_id).await;
            return;
        }

        // A vanished parent cancels the wake; the digest downgrades to
        // a log line so the tick is still observable.
        let parent_live = registry
            .get(&parent_id)
            .await
            .is_some_and(|s| s.status != SessionStatus::Stopped);
        if !parent_live {
            warn!(child_id, parent_id, "parent gone, cancelling wake registration");
            let _ = wake_repo.deactivate(&child_id).await;
            return;
        }

        let digest = {
            let mut reg = reg.lock().await;
            let no_progress = reg.last_wake_at.is_some()
                && reg.last_status_at_prev_wake.is_some()
                && child.agent_status_at == reg.last_status_at_prev_wake;
            if no_progress && !reg.escalated {
                reg.escalated = true;
                reg.period_s = config.wake_escalated_period_s;
                info!(child_id, period_s = reg.period_s, "wake escalated");
            }

            let recent = tool_events
                .last_for_session(&child_id, 5)
                .await
                .unwrap_or_default();
            let digest = assemble_wake_digest(&child, &reg, no_progress, &recent);

            reg.last_wake_at = Some(Utc::now());
            reg.last_status_at_prev_wake = child.agent_status_at;
            if let Err(err) = wake_repo.record_wake(&reg).await {
                warn!(child_id, %err, "failed to persist wake tick");
            }
            digest
        };

        let _ = event_tx
            .send(ReminderEvent::ParentWake {
                parent_id: parent_id.clone(),
                child_id: child_id.clone(),
                digest,
            })
            .await;
    }
}

/// Build the parent-facing digest: child status, run duration, recent
/// tool activity, and the no-progress warning when applicable.
fn assemble_wake_digest(
    child: &crate::models::session::Session,
    reg: &ParentWakeRegistration,
    no_progress: bool,
    recent: &[crate::persistence::tool_events::ToolEvent],
) -> String {
    let minutes = (Utc::now() - reg.registered_at).num_minutes().max(0);
    let status = child
        .agent_status_text
        .as_deref()
        .unwrap_or("(no status reported)");

    let mut digest = format!(
        "[dispatch] Child update: {} — {minutes}m running\nStatus: {status}",
        child.display_name()
    );
    if no_progress {
        digest.push_str("\nWarning: NO PROGRESS DETECTED since the last wake");
    }
    if !recent.is_empty() {
        digest.push_str("\nRecent activity:");
        for event in recent {
            let detail = event
                .bash_command
                .as_deref()
                .or(event.target_file.as_deref())
                .unwrap_or("");
            digest.push_str(&format!("\n  - {} {detail}", event.tool_name));
        }
    }
    digest
}

/// Spawn the consumer that turns reminder events into queued messages.
///
/// Runs until the token fires or the channel closes.
#[must_use]
pub fn spawn_reminder_consumer(
    mut rx: mpsc::Receiver<ReminderEvent>,
    engine: Arc<DeliveryEngine>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("reminder consumer shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(event) = maybe_event { event } else {
                        info!("reminder channel closed");
                        break;
                    }
                }
            };

            let request = match event {
                ReminderEvent::SoftRemind {
                    target_id,
                    silent_for_s,
                } => EnqueueRequest {
                    target_id,
                    text: format!(
                        "Status check: no update received for {silent_for_s}s. \
                         Reply with a brief status update and keep going."
                    ),
                    mode: DeliveryMode::Important,
                    ..EnqueueRequest::default()
                },
                ReminderEvent::HardRemind {
                    target_id,
                    silent_for_s,
                } => EnqueueRequest {
                    target_id,
                    text: format!(
                        "No status update for {silent_for_s}s. Report your status \
                         now and continue the task."
                    ),
                    mode: DeliveryMode::Urgent,
                    ..EnqueueRequest::default()
                },
                ReminderEvent::ParentWake {
                    parent_id,
                    child_id,
                    digest,
                } => EnqueueRequest {
                    target_id: parent_id,
                    sender_id: Some(child_id),
                    text: digest,
                    mode: DeliveryMode::Important,
                    ..EnqueueRequest::default()
                },
            };

            if let Err(err) = engine.enqueue(request).await {
                warn!(%err, "failed to queue reminder message");
            }
        }
    })
}
