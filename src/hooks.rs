//! Agent hook callback handling.
//!
//! Agents fire HTTP callbacks on tool use, stop, and context events.
//! Payloads are JSON with unknown fields ignored; a payload without a
//! recognized session id falls back to matching by transcript path.
//! Events fan out to the tracker, delivery engine, reminder scheduler,
//! and the observability store.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::models::message::{DeliveryMode, MessageCategory};
use crate::models::session::{Session, SessionStatus};
use crate::orchestrator::delivery::EnqueueRequest;
use crate::orchestrator::Core;
use crate::persistence::tool_events::ToolEvent;

/// Context-usage fraction that triggers the one-shot warning notice.
const CONTEXT_WARNING_PCT: f64 = 70.0;
/// Context-usage fraction that triggers the one-shot critical notice.
const CONTEXT_CRITICAL_PCT: f64 = 85.0;

/// Decoded hook payload. Unknown fields are ignored by serde.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HookPayload {
    /// Event name as sent by the agent.
    #[serde(default)]
    pub event: String,
    /// Session the hook belongs to, when known to the agent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Transcript path, also used as a session-matching fallback.
    #[serde(default)]
    pub transcript_path: Option<String>,
    /// Tool name for tool-use events.
    #[serde(default)]
    pub tool_name: Option<String>,
    /// File the tool touched.
    #[serde(default)]
    pub target_file: Option<String>,
    /// Shell command for Bash-like tools.
    #[serde(default)]
    pub bash_command: Option<String>,
    /// Tokens consumed, for context-usage events.
    #[serde(default)]
    pub tokens_used: Option<u64>,
    /// Context-window usage percentage, for context-usage events.
    #[serde(default)]
    pub context_pct: Option<f64>,
}

/// Route one hook payload into the core.
pub async fn dispatch(core: &Arc<Core>, payload: HookPayload) {
    let Some(session) = resolve_session(core, &payload).await else {
        debug!(event = %payload.event, "hook for unknown session ignored");
        return;
    };

    match payload.event.as_str() {
        "PreToolUse" | "PostToolUse" => on_tool_use(core, &session, &payload).await,
        "Stop" => {
            core.engine
                .handle_stop_signal(&session.id, payload.transcript_path.as_deref())
                .await;
            if core.tracker.is_idle(&session.id).await {
                core.notify_remote(&session.id, format!("{} is idle", session.display_name()))
                    .await;
            }
        }
        // `turn_complete` is the app-server provider's RPC equivalent
        // of an idle notification; no fence applies to either.
        "Notification" | "idle_prompt" | "turn_complete" => {
            core.tracker.mark_idle(&session.id).await;
            let _ = core
                .registry
                .update_status(&session.id, SessionStatus::Idle)
                .await;
            let engine = Arc::clone(&core.engine);
            let target = session.id.clone();
            tokio::spawn(async move {
                engine.flush_target(&target, false).await;
            });
        }
        "context_usage" => on_context_usage(core, &session, &payload).await,
        "compaction" => on_compaction_start(core, &session).await,
        "compaction_complete" => {
            let _ = core
                .registry
                .update(&session.id, |s| s.is_compacting = false)
                .await;
            core.scheduler.agent_status_update(&session.id).await;
            info!(session_id = %session.id, "compaction complete");
        }
        "context_reset" => {
            if let Err(err) = core.engine.cancel_context_monitor_from(&session.id).await {
                warn!(session_id = %session.id, %err, "context-monitor cancel failed");
            }
            let _ = core
                .registry
                .update(&session.id, |s| {
                    s.context_warning_sent = false;
                    s.context_critical_sent = false;
                    s.tokens_used = None;
                })
                .await;
            info!(session_id = %session.id, "context reset");
        }
        "SessionStart" => {
            let transcript = payload.transcript_path.clone();
            let _ = core
                .registry
                .update(&session.id, |s| {
                    if transcript.is_some() {
                        s.transcript_path = transcript;
                    }
                    s.last_activity = Utc::now();
                })
                .await;
            core.tracker.mark_active(&session.id).await;
        }
        other => debug!(session_id = %session.id, event = other, "unrecognized hook event"),
    }
}

/// Find the session a payload refers to: explicit id first, then the
/// transcript-path fallback.
async fn resolve_session(core: &Arc<Core>, payload: &HookPayload) -> Option<Session> {
    if let Some(ref id) = payload.session_id {
        if let Some(session) = core.registry.get(id).await {
            return Some(session);
        }
    }
    let path = payload.transcript_path.as_deref()?;
    core.registry
        .list()
        .await
        .into_iter()
        .find(|s| s.transcript_path.as_deref() == Some(path))
}

async fn on_tool_use(core: &Arc<Core>, session: &Session, payload: &HookPayload) {
    let tool_name = payload.tool_name.clone().unwrap_or_else(|| "unknown".into());

    let event = ToolEvent {
        session_id: session.id.clone(),
        tool_name: tool_name.clone(),
        target_file: payload.target_file.clone(),
        bash_command: payload.bash_command.clone(),
        created_at: Utc::now(),
    };
    if let Err(err) = core.tool_events.insert(&event).await {
        warn!(session_id = %session.id, %err, "failed to record tool event");
    }

    let _ = core
        .registry
        .update(&session.id, |s| {
            s.last_tool_call = Some(Utc::now());
            s.last_tool_name = Some(tool_name);
            s.last_activity = Utc::now();
        })
        .await;
    core.tracker.mark_active(&session.id).await;
    let _ = core
        .registry
        .update_status(&session.id, SessionStatus::Running)
        .await;
}

async fn on_context_usage(core: &Arc<Core>, session: &Session, payload: &HookPayload) {
    if let Some(tokens) = payload.tokens_used {
        let _ = core
            .registry
            .update(&session.id, |s| s.tokens_used = Some(tokens))
            .await;
    }
    let Some(pct) = payload.context_pct else {
        return;
    };
    if !session.context_monitor_enabled {
        return;
    }

    if pct >= CONTEXT_CRITICAL_PCT && !session.context_critical_sent {
        let _ = core
            .registry
            .update(&session.id, |s| s.context_critical_sent = true)
            .await;
        let text = format!(
            "Context critical: {} is at {pct:.0}% of its window. Hand off now.",
            session.display_name()
        );
        send_context_notice(core, session, text).await;
    } else if pct >= CONTEXT_WARNING_PCT && !session.context_warning_sent {
        let _ = core
            .registry
            .update(&session.id, |s| s.context_warning_sent = true)
            .await;
        let text = format!(
            "Context warning: {} is at {pct:.0}% of its window. Plan a handoff.",
            session.display_name()
        );
        send_context_notice(core, session, text).await;
    }
}

async fn on_compaction_start(core: &Arc<Core>, session: &Session) {
    let _ = core
        .registry
        .update(&session.id, |s| s.is_compacting = true)
        .await;
    info!(session_id = %session.id, "compaction started");

    if session.context_monitor_enabled {
        let text = format!(
            "Auto-compaction started for {}; it is flushing its context window.",
            session.display_name()
        );
        send_context_notice(core, session, text).await;
    }
}

/// Queue a context-monitor notice from the session to its parent.
/// These rows carry the `context_monitor` category so a clear can
/// cancel exactly them and nothing else.
async fn send_context_notice(core: &Arc<Core>, session: &Session, text: String) {
    let Some(ref parent_id) = session.parent_id else {
        debug!(session_id = %session.id, "no parent for context notice, logging only: {text}");
        return;
    };
    let request = EnqueueRequest {
        target_id: parent_id.clone(),
        sender_id: Some(session.id.clone()),
        text,
        mode: DeliveryMode::Important,
        category: Some(MessageCategory::ContextMonitor),
        ..EnqueueRequest::default()
    };
    if let Err(err) = core.engine.enqueue(request).await {
        warn!(session_id = %session.id, %err, "failed to queue context notice");
    }
}
