//! Idle and activity tracking.
//!
//! The tracker is the arbiter of whether a session is idle. It owns the
//! per-target [`DeliveryState`] map and reconciles three signal classes:
//! stop/notification hooks (Claude panes), prompt inspection of captured
//! pane text (both tmux providers), and turn-complete RPCs from the
//! app-server provider.
//!
//! The skip fence lives here: a `/clear` issued by the handoff
//! coordinator produces a stop hook that must not be mistaken for the
//! agent going idle. The fence absorbs it, bounded by a TTL so a lost
//! hook cannot wedge the session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::delivery::DeliveryState;
use crate::Result;

/// Delay before retrying a transcript read that returned nothing.
const RETRY_EMPTY: Duration = Duration::from_millis(500);
/// Delay before retrying a transcript read that returned stale content.
const RETRY_STALE: Duration = Duration::from_millis(300);

/// Outcome of routing a stop signal through the fence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDisposition {
    /// Absorbed by the skip fence; the session stays running.
    Absorbed,
    /// A handoff is pending: schedule the wake message instead of idling.
    HandoffWake(PathBuf),
    /// Genuine stop: the session is idle, pending messages may flush.
    Idle,
}

/// Per-target idle state store.
pub struct IdleTracker {
    states: Mutex<HashMap<String, DeliveryState>>,
    fence_ttl: chrono::Duration,
}

impl IdleTracker {
    /// Build a tracker with the given skip-fence TTL.
    #[must_use]
    pub fn new(fence_ttl: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            fence_ttl: chrono::Duration::from_std(fence_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(8)),
        }
    }

    /// Run a closure against the target's state, creating it lazily.
    pub async fn with_state<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut DeliveryState) -> R,
    ) -> R {
        let mut states = self.states.lock().await;
        let state = states
            .entry(session_id.to_owned())
            .or_insert_with(|| DeliveryState::new(session_id));
        f(state)
    }

    /// Snapshot the target's state, if one exists.
    pub async fn state(&self, session_id: &str) -> Option<DeliveryState> {
        self.states.lock().await.get(session_id).cloned()
    }

    /// Whether the target is currently considered idle.
    pub async fn is_idle(&self, session_id: &str) -> bool {
        self.states
            .lock()
            .await
            .get(session_id)
            .is_some_and(|s| s.is_idle)
    }

    /// Mark the target active (delivery, urgent enqueue, activity RPC).
    pub async fn mark_active(&self, session_id: &str) {
        self.with_state(session_id, |state| {
            state.is_idle = false;
            state.last_active_at = Some(Utc::now());
        })
        .await;
    }

    /// Mark the target idle from a non-hook source (prompt inspection,
    /// app-server turn-complete). Does not consult the fence: only stop
    /// hooks are subject to absorption.
    pub async fn mark_idle(&self, session_id: &str) {
        self.with_state(session_id, |state| {
            state.is_idle = true;
            state.last_idle_at = Some(Utc::now());
        })
        .await;
    }

    /// Arm the skip fence ahead of a `/clear` injection.
    pub async fn arm_skip_fence(&self, session_id: &str) {
        self.with_state(session_id, |state| {
            state.stop_notify_skip_count += 1;
            state.skip_count_armed_at = Some(Utc::now());
        })
        .await;
        debug!(session_id, "skip fence armed");
    }

    /// Store the continuation path consumed by the next stop signal.
    pub async fn set_pending_handoff(&self, session_id: &str, path: PathBuf) {
        self.with_state(session_id, |state| {
            state.pending_handoff_path = Some(path);
        })
        .await;
    }

    /// Route a stop signal through the fence and the pending-handoff
    /// branch. Pure state transition; the caller acts on the returned
    /// disposition (flush, wake enqueue, status downgrade).
    pub async fn apply_stop_signal(&self, session_id: &str) -> StopDisposition {
        let now = Utc::now();
        let ttl = self.fence_ttl;
        self.with_state(session_id, |state| {
            if state.stop_notify_skip_count > 0 {
                let fresh = state
                    .skip_count_armed_at
                    .is_some_and(|armed| now - armed < ttl);
                if fresh {
                    state.stop_notify_skip_count -= 1;
                    if state.stop_notify_skip_count == 0 {
                        state.skip_count_armed_at = None;
                    }
                    if let Some(path) = state.pending_handoff_path.take() {
                        info!(session_id, "stop signal routed to handoff wake");
                        return StopDisposition::HandoffWake(path);
                    }
                    debug!(session_id, "stop signal absorbed by skip fence");
                    return StopDisposition::Absorbed;
                }
                // Armed longer than the hook transport timeout: the clear
                // hook was lost. Reset the whole fence and process normally.
                warn!(session_id, "skip fence expired, resetting");
                state.clear_fence();
                state.pending_handoff_path = None;
            } else if let Some(path) = state.pending_handoff_path.take() {
                // Fence already drained by an earlier signal but the wake
                // was not scheduled yet; honor the continuation.
                info!(session_id, "stop signal routed to late handoff wake");
                return StopDisposition::HandoffWake(path);
            }

            state.is_idle = true;
            state.last_idle_at = Some(now);
            StopDisposition::Idle
        })
        .await
    }

    /// Record which target a session last sent to, to suppress
    /// self-echo stop notifications.
    pub async fn note_outgoing_send(&self, sender_id: &str, target_id: &str) {
        self.with_state(sender_id, |state| {
            state.last_outgoing_send_target = Some(target_id.to_owned());
        })
        .await;
    }

    /// Arm a stop notification from `target` back to `sender`.
    pub async fn arm_stop_notify(&self, target_id: &str, sender_id: &str) {
        self.with_state(target_id, |state| {
            state.stop_notify_sender_id = Some(sender_id.to_owned());
        })
        .await;
    }

    /// Take the armed stop-notification sender, if any.
    pub async fn take_stop_notify(&self, target_id: &str) -> Option<String> {
        self.with_state(target_id, |state| state.stop_notify_sender_id.take())
            .await
    }

    /// Clear sender ownership hints and optionally arm the fence. Used
    /// by the explicit cache-invalidation path on session clear.
    pub async fn invalidate(&self, session_id: &str, arm_skip: bool) {
        let mut states = self.states.lock().await;
        if !arm_skip && !states.contains_key(session_id) {
            return;
        }
        let state = states
            .entry(session_id.to_owned())
            .or_insert_with(|| DeliveryState::new(session_id));
        state.stop_notify_sender_id = None;
        state.last_response = None;
        if arm_skip {
            state.stop_notify_skip_count += 1;
            state.skip_count_armed_at = Some(Utc::now());
        }
    }

    /// Drop the state for a removed session.
    pub async fn forget(&self, session_id: &str) {
        self.states.lock().await.remove(session_id);
    }

    /// Read the last assistant response from a transcript with the
    /// bounded retry policy: one 500 ms retry when the read returns
    /// nothing (the agent has not flushed yet), or one 300 ms retry when
    /// it equals the previously stored response (stale). The two retries
    /// are mutually exclusive by precondition.
    ///
    /// On double failure the caller proceeds without the payload.
    pub async fn last_response_with_retries(
        &self,
        session_id: &str,
        transcript_path: &str,
    ) -> Option<String> {
        let stored = self
            .state(session_id)
            .await
            .and_then(|state| state.last_response);

        let first = read_last_assistant_turn(transcript_path).ok().flatten();
        let resolved = match first {
            None => {
                tokio::time::sleep(RETRY_EMPTY).await;
                read_last_assistant_turn(transcript_path).ok().flatten()
            }
            Some(response) if stored.as_deref() == Some(response.as_str()) => {
                tokio::time::sleep(RETRY_STALE).await;
                match read_last_assistant_turn(transcript_path).ok().flatten() {
                    Some(fresh) if stored.as_deref() != Some(fresh.as_str()) => Some(fresh),
                    _ => None,
                }
            }
            Some(response) => Some(response),
        };

        if let Some(ref response) = resolved {
            self.with_state(session_id, |state| {
                state.last_response = Some(response.clone());
            })
            .await;
        }
        resolved
    }
}

/// Whether captured pane text shows an idle input prompt.
///
/// The last non-empty line, trimmed of trailing whitespace, must equal
/// the provider glyph exactly. A line like `"> typed but unsent"` is a
/// typed-but-unsubmitted state, not idle.
#[must_use]
pub fn prompt_shows_idle(capture: &str, glyph: &str) -> bool {
    capture
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.trim_end() == glyph)
}

/// Extract the last assistant turn from a transcript file.
///
/// The transcript is JSON-lines; assistant entries carry their text
/// under `message.content[].text`.
fn read_last_assistant_turn(path: &str) -> Result<Option<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut last = None;
    for line in raw.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("assistant") {
            continue;
        }
        let Some(content) = value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_array())
        else {
            continue;
        };
        let text = content
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            last = Some(text);
        }
    }
    Ok(last)
}

/// Spawn the background prompt inspector.
///
/// Hook-less pane providers (Codex CLI) have no stop signal, so their
/// idleness is reconciled from pane captures: a visible prompt glyph
/// marks the session idle and flushes its queue; anything else marks it
/// running. Claude panes are left to their hooks here.
#[must_use]
pub fn spawn_prompt_inspector(
    registry: std::sync::Arc<super::registry::SessionRegistry>,
    tracker: std::sync::Arc<IdleTracker>,
    engine: std::sync::Arc<super::delivery::DeliveryEngine>,
    driver: std::sync::Arc<dyn crate::driver::TerminalDriver>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    use crate::models::session::{Provider, SessionStatus};

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("prompt inspector shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            for session in registry.list().await {
                if session.provider != Provider::CodexTmux
                    || session.status == SessionStatus::Stopped
                {
                    continue;
                }
                let Some(glyph) = session.provider.prompt_glyph() else {
                    continue;
                };
                let capture = match driver.capture_pane(session.pane_ref(), false).await {
                    Ok(capture) => capture,
                    Err(err) => {
                        debug!(session_id = %session.id, %err, "prompt inspection capture failed");
                        continue;
                    }
                };

                if prompt_shows_idle(&capture, glyph) {
                    let was_idle = tracker.is_idle(&session.id).await;
                    tracker.mark_idle(&session.id).await;
                    if session.status != SessionStatus::Idle {
                        let _ = registry
                            .update_status(&session.id, SessionStatus::Idle)
                            .await;
                    }
                    if !was_idle {
                        let engine = std::sync::Arc::clone(&engine);
                        let target = session.id.clone();
                        tokio::spawn(async move {
                            engine.flush_target(&target, false).await;
                        });
                    }
                } else if tracker.is_idle(&session.id).await {
                    tracker.mark_active(&session.id).await;
                    let _ = registry
                        .update_status(&session.id, SessionStatus::Running)
                        .await;
                }
            }
        }
    })
}
