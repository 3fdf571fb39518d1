//! Control-plane route handlers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::hooks::{self, HookPayload};
use crate::models::message::DeliveryMode;
use crate::models::session::{Provider, Session};
use crate::orchestrator::delivery::EnqueueRequest;
use crate::orchestrator::{Core, CreateSessionParams};
use crate::AppError;

use super::error_response;

/// Liveness probe.
pub async fn health() -> &'static str {
    "ok"
}

fn session_json(session: &Session) -> Value {
    json!({
        "id": session.id,
        "provider": session.provider,
        "tmux_name": session.tmux_name,
        "parent_id": session.parent_id,
        "working_dir": session.working_dir,
        "friendly_name": session.friendly_name,
        "status": session.status,
        "created_at": session.created_at,
        "last_activity": session.last_activity,
        "last_tool_call": session.last_tool_call,
        "last_tool_name": session.last_tool_name,
        "tokens_used": session.tokens_used,
        "context_monitor_enabled": session.context_monitor_enabled,
        "is_em": session.is_em,
        "log_file": session.log_file,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    provider: Provider,
    working_dir: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    is_em: bool,
}

/// `POST /sessions`
pub async fn create_session(
    State(core): State<Arc<Core>>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let params = CreateSessionParams {
        provider: body.provider,
        working_dir: body.working_dir,
        parent_id: body.parent_id,
        friendly_name: body.friendly_name,
        is_em: body.is_em,
    };
    match core.create_session(params).await {
        Ok(session) => Json(session_json(&session)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `GET /sessions`
pub async fn list_sessions(State(core): State<Arc<Core>>) -> Json<Value> {
    let sessions = core.registry.list().await;
    let list: Vec<Value> = sessions.iter().map(session_json).collect();
    Json(json!({ "sessions": list }))
}

/// `GET /sessions/{id}`
pub async fn get_session(State(core): State<Arc<Core>>, Path(id): Path<String>) -> Response {
    match core.registry.resolve(&id).await {
        Ok(session) => {
            let pending = core.engine.pending_count(&session.id).await.unwrap_or(0);
            let mut body = session_json(&session);
            body["pending_messages"] = json!(pending);
            body["is_idle"] = json!(core.tracker.is_idle(&session.id).await);
            Json(body).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// `DELETE /sessions/{id}`
pub async fn kill_session(State(core): State<Arc<Core>>, Path(id): Path<String>) -> Response {
    match core.kill_session(&id).await {
        Ok(session) => Json(json!({ "id": session.id, "status": session.status })).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct InputBody {
    text: String,
    #[serde(default)]
    mode: DeliveryMode,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    remind_soft_s: Option<u64>,
    #[serde(default)]
    remind_hard_s: Option<u64>,
    #[serde(default)]
    notify_on_stop: bool,
}

/// `POST /sessions/{id}/input`
pub async fn enqueue_input(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let request = EnqueueRequest {
        target_id: session.id,
        sender_id: body.sender_id,
        parent_id: body.parent_id,
        text: body.text,
        mode: body.mode,
        category: None,
        remind_soft_s: body.remind_soft_s,
        remind_hard_s: body.remind_hard_s,
        notify_on_stop: body.notify_on_stop,
    };
    match core.engine.enqueue(request).await {
        Ok(msg) => Json(json!({
            "id": msg.id,
            "target_id": msg.target_id,
            "mode": msg.mode,
            "queued_at": msg.queued_at,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyBody {
    key: String,
}

/// `POST /sessions/{id}/key` — low-level key passthrough, serialized
/// against deliveries via the target lock.
pub async fn send_key(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Json(body): Json<KeyBody>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let lock = core.engine.target_lock(&session.id).await;
    let _guard = lock.lock().await;
    let pane = session.pane_ref();
    let result = match body.key.as_str() {
        "escape" => core.driver.send_cancel_key(pane).await,
        "enter" => core.driver.send_submit_key(pane).await,
        other => Err(AppError::InvalidState(format!("unsupported key '{other}'"))),
    };
    match result {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct HandoffBody {
    continuation_path: PathBuf,
}

/// `POST /sessions/{id}/handoff`
pub async fn run_handoff(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Json(body): Json<HandoffBody>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    match core.handoff.run(&session.id, &body.continuation_path).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct OutputQuery {
    #[serde(default = "default_lines")]
    lines: usize,
}

fn default_lines() -> usize {
    40
}

/// `GET /sessions/{id}/output?lines=N` — last N pane lines, ANSI-stripped.
pub async fn get_output(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    match core.driver.capture_pane(session.pane_ref(), true).await {
        Ok(capture) => {
            let stripped = strip_ansi(&capture);
            let lines: Vec<&str> = stripped.lines().collect();
            let tail = lines
                .iter()
                .skip(lines.len().saturating_sub(query.lines))
                .copied()
                .collect::<Vec<_>>()
                .join("\n");
            Json(json!({ "output": tail })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    text: String,
}

/// `POST /sessions/{id}/status` — explicit agent status update; resets
/// the reminder clock.
pub async fn agent_status(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let update = core
        .registry
        .update(&session.id, |s| {
            s.agent_status_text = Some(body.text.clone());
            s.agent_status_at = Some(Utc::now());
            s.last_activity = Utc::now();
        })
        .await;
    if let Err(err) = update {
        return error_response(&err);
    }
    core.tracker.mark_active(&session.id).await;
    core.scheduler.agent_status_update(&session.id).await;
    Json(json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize, Default)]
pub struct InvalidateBody {
    #[serde(default)]
    arm_skip: bool,
}

/// `POST /sessions/{id}/invalidate-cache` — clear cached ownership
/// hints and stale context-monitor traffic; optionally arm the skip
/// fence ahead of an external `/clear`.
pub async fn invalidate_cache(
    State(core): State<Arc<Core>>,
    Path(id): Path<String>,
    Json(body): Json<InvalidateBody>,
) -> Response {
    let session = match core.registry.resolve(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    core.tracker.invalidate(&session.id, body.arm_skip).await;
    match core.engine.cancel_context_monitor_from(&session.id).await {
        Ok(cancelled) => Json(json!({ "ok": true, "cancelled": cancelled })).into_response(),
        Err(err) => error_response(&err),
    }
}

/// `POST /hooks/{provider}` — agent callback sink.
pub async fn hook_sink(
    State(core): State<Arc<Core>>,
    Path(provider): Path<String>,
    Json(payload): Json<HookPayload>,
) -> Json<Value> {
    tracing::debug!(provider, event = %payload.event, "hook received");
    hooks::dispatch(&core, payload).await;
    Json(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
pub struct WatchBody {
    target: String,
    observer: String,
    #[serde(default = "default_watch_timeout")]
    timeout_s: u64,
}

fn default_watch_timeout() -> u64 {
    600
}

/// `POST /watch` — register a one-shot idle watcher.
pub async fn create_watch(
    State(core): State<Arc<Core>>,
    Json(body): Json<WatchBody>,
) -> Response {
    match core
        .watchers
        .watch(&body.target, &body.observer, body.timeout_s)
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Remove ANSI escape sequences (CSI and OSC) from captured pane text.
fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ ... terminated by a byte in 0x40-0x7e.
            Some('[') => {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ESC \.
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\u{7}' {
                        break;
                    }
                    if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Two-char escape.
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}
