//! Telegram remote-chat gateway.
//!
//! Inbound: a long-poll loop over the Bot API `getUpdates` method.
//! Every poll carries an explicit total request timeout — shorter than
//! the transport default — and a supervisor restarts the poll loop when
//! no round-trip has been observed for the configured stall window.
//! Per-chunk timeouts alone do not fire on a silently stalled TCP
//! connection kept warm by keepalive traffic.
//!
//! Outbound: plain sends to `(chat, thread)` with an opportunistic
//! fallback to the bare chat when the thread has been closed.
//!
//! Forum threads map 1:1 to sessions; the registry's `em_topic` carries
//! the operator thread across successive EM sessions.

pub mod client;

pub use client::TelegramClient;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TelegramConfig;
use crate::models::message::DeliveryMode;
use crate::orchestrator::delivery::EnqueueRequest;
use crate::orchestrator::Core;

/// An outbound notice addressed to a session's chat thread.
#[derive(Debug, Clone)]
pub struct RemoteNotice {
    /// Session whose thread receives the text.
    pub session_id: String,
    /// Notice body.
    pub text: String,
}

/// Spawn the inbound poll supervisor.
///
/// The supervisor owns the poll loop and restarts it whenever the
/// health window elapses without a completed round-trip.
#[must_use]
pub fn spawn_gateway(
    core: Arc<Core>,
    client: Arc<TelegramClient>,
    config: TelegramConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let offset = Arc::new(Mutex::new(0_i64));
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let poller_cancel = cancel.child_token();
            let last_roundtrip = Arc::new(Mutex::new(tokio::time::Instant::now()));

            let poller = tokio::spawn(run_poll_loop(
                Arc::clone(&core),
                Arc::clone(&client),
                config.clone(),
                Arc::clone(&offset),
                Arc::clone(&last_roundtrip),
                poller_cancel.clone(),
            ));

            // Health monitor: watch for a silent stall, then restart.
            let stall = Duration::from_secs(config.health_stall_s);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        poller_cancel.cancel();
                        let _ = poller.await;
                        info!("telegram gateway shutting down");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
                let elapsed = last_roundtrip.lock().await.elapsed();
                if elapsed > stall {
                    warn!(?elapsed, "telegram poll stalled, restarting poll loop");
                    poller_cancel.cancel();
                    let _ = poller.await;
                    break;
                }
            }
        }
    })
}

/// One life of the poll loop; the supervisor restarts it on stall.
async fn run_poll_loop(
    core: Arc<Core>,
    client: Arc<TelegramClient>,
    config: TelegramConfig,
    offset: Arc<Mutex<i64>>,
    last_roundtrip: Arc<Mutex<tokio::time::Instant>>,
    cancel: CancellationToken,
) {
    loop {
        let current_offset = *offset.lock().await;
        let updates = tokio::select! {
            () = cancel.cancelled() => return,
            result = client.get_updates(current_offset, config.poll_timeout_s) => result,
        };
        *last_roundtrip.lock().await = tokio::time::Instant::now();

        let updates = match updates {
            Ok(updates) => updates,
            Err(err) => {
                warn!(%err, "telegram poll failed");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        for update in updates {
            *offset.lock().await = update.update_id.saturating_add(1);
            let Some(message) = update.message else {
                continue;
            };
            let Some(text) = message.text else { continue };
            if message.chat.id != config.chat_id {
                warn!(chat_id = message.chat.id, "telegram message from unexpected chat denied");
                continue;
            }
            route_inbound(&core, message.message_thread_id, text).await;
        }
    }
}

/// Map an inbound message to the session paired with its forum thread
/// and enqueue it for sequential delivery.
async fn route_inbound(core: &Arc<Core>, thread_id: Option<i64>, text: String) {
    let session = core
        .registry
        .list()
        .await
        .into_iter()
        .find(|s| s.chat_thread_id == thread_id && thread_id.is_some());
    let Some(session) = session else {
        debug!(?thread_id, "inbound message has no paired session, ignoring");
        return;
    };

    let request = EnqueueRequest {
        target_id: session.id.clone(),
        text,
        mode: DeliveryMode::Sequential,
        ..EnqueueRequest::default()
    };
    if let Err(err) = core.engine.enqueue(request).await {
        warn!(session_id = %session.id, %err, "failed to queue inbound chat message");
    }
}

/// Spawn the outbound sender: resolves each notice's session thread and
/// posts the text, falling back to the bare chat on a closed thread.
#[must_use]
pub fn spawn_outbound_sender(
    core: Arc<Core>,
    client: Arc<TelegramClient>,
    chat_id: i64,
    mut rx: mpsc::Receiver<RemoteNotice>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notice = tokio::select! {
                () = cancel.cancelled() => {
                    info!("telegram outbound sender shutting down");
                    break;
                }
                maybe = rx.recv() => {
                    if let Some(notice) = maybe { notice } else { break }
                }
            };

            let thread_id = core
                .registry
                .get(&notice.session_id)
                .await
                .and_then(|s| s.chat_thread_id);
            if let Err(err) = client.send_message(chat_id, thread_id, &notice.text).await {
                warn!(session_id = %notice.session_id, %err, "telegram send failed");
            }
        }
    })
}
