//! Loopback HTTP control plane.
//!
//! Bound to 127.0.0.1 with no authentication — the local process
//! boundary is the trust boundary. Serves session CRUD, message
//! enqueueing, the handoff protocol, watch registration, and the hook
//! callback sink.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::orchestrator::Core;
use crate::{AppError, Result};

/// Map a domain error onto an HTTP response with a JSON error body.
pub(crate) fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::InvalidState(_) | AppError::Config(_) => StatusCode::CONFLICT,
        AppError::Driver(_) | AppError::Transport(_) => StatusCode::BAD_GATEWAY,
        AppError::Db(_) | AppError::Http(_) | AppError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Build the control-plane router.
#[must_use]
pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/sessions",
            post(routes::create_session).get(routes::list_sessions),
        )
        .route(
            "/sessions/:id",
            get(routes::get_session).delete(routes::kill_session),
        )
        .route("/sessions/:id/input", post(routes::enqueue_input))
        .route("/sessions/:id/key", post(routes::send_key))
        .route("/sessions/:id/handoff", post(routes::run_handoff))
        .route("/sessions/:id/output", get(routes::get_output))
        .route("/sessions/:id/status", post(routes::agent_status))
        .route(
            "/sessions/:id/invalidate-cache",
            post(routes::invalidate_cache),
        )
        .route("/hooks/:provider", post(routes::hook_sink))
        .route("/watch", post(routes::create_watch))
        .with_state(core)
}

/// Serve the control plane until the token fires.
///
/// # Errors
///
/// Returns `AppError::Http` if the listener cannot bind.
pub async fn serve(core: Arc<Core>, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Http(format!("failed to bind {addr}: {err}")))?;
    info!(%addr, "control plane listening");

    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("control plane failed: {err}")))
}
