//! Session orchestration core.
//!
//! Covers the session registry, delivery engine, idle tracking,
//! reminder scheduling, the handoff protocol, and idle watchers, glued
//! together by [`Core`].
//!
//! Dependency order, leaves first: registry → tracker → delivery →
//! reminders, handoff, watchers.

pub mod delivery;
pub mod handoff;
pub mod registry;
pub mod reminders;
pub mod tracker;
pub mod watchers;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::driver::TerminalDriver;
use crate::models::session::{Provider, Session, SessionStatus};
use crate::persistence::tool_events::ToolEventRepo;
use crate::telegram::{RemoteNotice, TelegramClient};
use crate::Result;

use self::delivery::DeliveryEngine;
use self::handoff::HandoffCoordinator;
use self::registry::{EmTopic, SessionRegistry};
use self::reminders::ReminderScheduler;
use self::tracker::IdleTracker;
use self::watchers::WatcherSet;

/// Parameters for spawning a session.
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    /// Agent runtime to launch.
    pub provider: Provider,
    /// Working directory for the agent.
    pub working_dir: String,
    /// Parent session for wake-up pairing.
    pub parent_id: Option<String>,
    /// Operator-assigned name.
    pub friendly_name: Option<String>,
    /// Whether this is the operator/EM session.
    pub is_em: bool,
}

/// Everything the control plane and gateways need, in one place.
pub struct Core {
    /// Parsed configuration.
    pub config: Arc<GlobalConfig>,
    /// Session table.
    pub registry: Arc<SessionRegistry>,
    /// Idle arbiter.
    pub tracker: Arc<IdleTracker>,
    /// Message queue and injection paths.
    pub engine: Arc<DeliveryEngine>,
    /// Reminder and wake timers.
    pub scheduler: Arc<ReminderScheduler>,
    /// One-shot idle watchers.
    pub watchers: Arc<WatcherSet>,
    /// Clear-then-reprime protocol.
    pub handoff: HandoffCoordinator,
    /// Terminal multiplexer seam.
    pub driver: Arc<dyn TerminalDriver>,
    /// Tool-usage observability store.
    pub tool_events: ToolEventRepo,
    /// Remote-chat API client, when the gateway is enabled.
    pub telegram: Option<Arc<TelegramClient>>,
    /// Outbound notices to the remote gateway.
    pub remote_tx: Option<mpsc::Sender<RemoteNotice>>,
}

impl Core {
    /// Spawn a new agent session: create the pane, wire the pipe log,
    /// pair the remote-chat thread, and persist the registry entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Driver` if pane creation fails and
    /// `AppError::Io` if the registry snapshot cannot be written.
    pub async fn create_session(&self, params: CreateSessionParams) -> Result<Session> {
        let mut session = Session::new(params.provider, params.working_dir.clone());
        session.parent_id = params.parent_id;
        session.friendly_name = params.friendly_name;
        session.is_em = params.is_em;

        if let Some(pane) = session.tmux_name.clone() {
            let command = match params.provider {
                Provider::ClaudeTmux => &self.config.claude_command,
                Provider::CodexTmux | Provider::CodexApp => &self.config.codex_command,
            };
            self.driver
                .create_pane(&pane, &params.working_dir, command)
                .await?;

            let log_file = self
                .config
                .pipe_log_dir
                .join(format!("{pane}.log"))
                .to_string_lossy()
                .into_owned();
            tokio::fs::create_dir_all(&self.config.pipe_log_dir).await?;
            if let Err(err) = self.driver.pipe_pane(&pane, &log_file).await {
                warn!(session_id = %session.id, %err, "pipe log setup failed");
            } else {
                session.log_file = log_file;
            }
        }

        self.pair_chat_thread(&mut session).await;

        let session = self.registry.create(session).await?;
        info!(session_id = %session.id, provider = ?session.provider, "session created");
        Ok(session)
    }

    /// Pair the session with a remote-chat forum thread. The EM session
    /// adopts the inherited topic when one exists, avoiding unbounded
    /// thread creation; everything is fail-open.
    async fn pair_chat_thread(&self, session: &mut Session) {
        let Some(ref client) = self.telegram else {
            return;
        };
        let chat_id = self.config.telegram.chat_id;

        if session.is_em {
            if let Some(topic) = self.registry.em_topic().await {
                session.chat_thread_id = topic.thread_id;
                info!(session_id = %session.id, thread_id = ?topic.thread_id, "EM session adopted inherited topic");
                return;
            }
        }

        match client
            .create_forum_topic(chat_id, session.display_name())
            .await
        {
            Ok(thread_id) => {
                session.chat_thread_id = Some(thread_id);
                if session.is_em {
                    let _ = self
                        .registry
                        .set_em_topic(Some(EmTopic {
                            chat_id,
                            thread_id: Some(thread_id),
                        }))
                        .await;
                }
            }
            Err(err) => {
                warn!(session_id = %session.id, %err, "forum topic creation failed, using bare chat");
            }
        }
    }

    /// Kill a session: cancel its timers and watchers, drop its queue,
    /// tear down the pane, and mark it stopped (terminal).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown identifiers.
    pub async fn kill_session(&self, identifier: &str) -> Result<Session> {
        let session = self.registry.resolve(identifier).await?;

        self.scheduler.cancel_remind(&session.id).await;
        self.scheduler.cancel_parent_wake(&session.id).await;
        self.watchers.cancel_for(&session.id).await;

        match self.engine.discard_pending(&session.id).await {
            Ok(dropped) if dropped > 0 => {
                info!(session_id = %session.id, dropped, "dropped queued messages on kill");
            }
            Ok(_) => {}
            Err(err) => warn!(session_id = %session.id, %err, "failed to drop queued messages"),
        }

        if let Some(ref pane) = session.tmux_name {
            if let Err(err) = self.driver.kill_pane(pane).await {
                warn!(session_id = %session.id, %err, "pane kill failed");
            }
        }

        let stopped = self
            .registry
            .update_status(&session.id, SessionStatus::Stopped)
            .await?;
        self.tracker.forget(&session.id).await;
        info!(session_id = %session.id, "session killed");
        Ok(stopped)
    }

    /// Crash recovery, run once at startup: sessions whose pane is gone
    /// are marked stopped, then the queue and wake registrations are
    /// reopened.
    pub async fn recover(&self) {
        for session in self.registry.list().await {
            if session.status == SessionStatus::Stopped {
                continue;
            }
            let Some(ref pane) = session.tmux_name else {
                continue;
            };
            let alive = self.driver.exists(pane).await.unwrap_or(false);
            if !alive {
                warn!(session_id = %session.id, pane, "backing pane gone, marking stopped");
                let _ = self
                    .registry
                    .update_status(&session.id, SessionStatus::Stopped)
                    .await;
            }
        }

        if let Err(err) = self.engine.recover().await {
            warn!(%err, "queue recovery failed");
        }
        self.scheduler.recover_parent_wakes().await;
    }

    /// Push a notice to the remote gateway, when one is running.
    pub async fn notify_remote(&self, session_id: &str, text: String) {
        if let Some(ref tx) = self.remote_tx {
            let _ = tx
                .send(RemoteNotice {
                    session_id: session_id.to_owned(),
                    text,
                })
                .await;
        }
    }
}
