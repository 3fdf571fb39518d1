//! Handoff coordinator: the atomic clear-then-reprime protocol.
//!
//! A handoff captures the pane scrollback, arms the skip fence so the
//! `/clear` stop hook is absorbed, stores the continuation path for the
//! pending-handoff branch, and issues the clear. The wake message is
//! deliberately NOT queued here — the next stop signal triggers it,
//! which is what carries state safely across the terminal reset instead
//! of racing against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::driver::TerminalDriver;
use crate::models::session::SessionStatus;
use crate::{AppError, Result};

use super::delivery::DeliveryEngine;
use super::registry::SessionRegistry;
use super::tracker::IdleTracker;

/// Runs the context-reset protocol for one target at a time.
pub struct HandoffCoordinator {
    registry: Arc<SessionRegistry>,
    tracker: Arc<IdleTracker>,
    driver: Arc<dyn TerminalDriver>,
    engine: Arc<DeliveryEngine>,
    handoff_dir: PathBuf,
}

impl HandoffCoordinator {
    /// Assemble the coordinator.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        tracker: Arc<IdleTracker>,
        driver: Arc<dyn TerminalDriver>,
        engine: Arc<DeliveryEngine>,
        handoff_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            tracker,
            driver,
            engine,
            handoff_dir,
        }
    }

    /// Run a handoff against `session_id`, pointing the wake message at
    /// `continuation_path`.
    ///
    /// Serialized against every delivery to the same target via the
    /// per-target lock; a second handoff queues behind the first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown targets,
    /// `AppError::InvalidState` for stopped or pane-less targets, and
    /// `AppError::Driver` when the `/clear` injection fails — in which
    /// case the handoff is abandoned, no wake is queued, and the fence
    /// drains by TTL.
    pub async fn run(&self, session_id: &str, continuation_path: &Path) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        if session.status == SessionStatus::Stopped {
            return Err(AppError::InvalidState(format!(
                "session {session_id} is stopped"
            )));
        }
        if !session.provider.has_pane() {
            return Err(AppError::InvalidState(
                "handoff requires a pane-backed session".into(),
            ));
        }

        let lock = self.engine.target_lock(session_id).await;
        let _guard = lock.lock().await;
        let pane = session.pane_ref();

        // 1. Scrollback snapshot, best-effort. The wake message simply
        //    omits the reference when the capture fails.
        self.snapshot_scrollback(session_id, pane).await;

        // 2-3. Fence first, then the pending path, so the stop hook the
        //      clear produces is absorbed and routed to the wake branch.
        self.tracker.arm_skip_fence(session_id).await;
        self.tracker
            .set_pending_handoff(session_id, continuation_path.to_path_buf())
            .await;

        // A clear invalidates any in-flight context-monitor chatter and
        // the running reminder for this target.
        if let Err(err) = self.engine.cancel_context_monitor_from(session_id).await {
            warn!(session_id, %err, "context-monitor cancel failed during handoff");
        }
        self.engine.scheduler().cancel_remind(session_id).await;
        let _ = self
            .registry
            .update(session_id, |s| {
                s.context_warning_sent = false;
                s.context_critical_sent = false;
            })
            .await;

        // 4. Issue the clear through the standard two-phase contract.
        if let Err(err) = self.engine.inject_two_phase(pane, "/clear").await {
            warn!(session_id, %err, "clear injection failed, abandoning handoff");
            self.tracker
                .with_state(session_id, |state| {
                    state.pending_handoff_path = None;
                })
                .await;
            return Err(err);
        }

        info!(session_id, continuation = %continuation_path.display(), "handoff armed");
        Ok(())
    }

    /// Capture the full scrollback into
    /// `<handoff_dir>/<id>-<ts>/dump.txt`. Failures are logged only.
    async fn snapshot_scrollback(&self, session_id: &str, pane: &str) {
        let capture = match self.driver.capture_pane(pane, true).await {
            Ok(capture) => capture,
            Err(err) => {
                warn!(session_id, %err, "scrollback capture failed, continuing without snapshot");
                return;
            }
        };
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let dir = self.handoff_dir.join(format!("{session_id}-{stamp}"));
        let write = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("dump.txt"), capture).await
        };
        if let Err(err) = write.await {
            warn!(session_id, %err, "failed to write scrollback snapshot");
        }
    }
}
