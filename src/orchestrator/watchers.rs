//! One-shot idle watchers.
//!
//! A watch registers an observer to be notified when a target goes
//! idle, or when a timeout elapses first. Watches mark the target
//! active before registering: without that, a target that was already
//! idle at watch time would resolve immediately and notify spuriously.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::message::DeliveryMode;
use crate::models::session::{Provider, SessionStatus};
use crate::Result;

use super::delivery::{DeliveryEngine, EnqueueRequest};
use super::registry::SessionRegistry;
use super::tracker::IdleTracker;

/// Live one-shot watch registrations, keyed by target.
pub struct WatcherSet {
    registry: Arc<SessionRegistry>,
    tracker: Arc<IdleTracker>,
    engine: Arc<DeliveryEngine>,
    poll_interval: Duration,
    root_cancel: CancellationToken,
    tasks: Mutex<HashMap<String, Vec<CancellationToken>>>,
}

impl WatcherSet {
    /// Assemble the watcher set.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        tracker: Arc<IdleTracker>,
        engine: Arc<DeliveryEngine>,
        poll_interval: Duration,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            tracker,
            engine,
            poll_interval,
            root_cancel,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a one-shot watch: notify `observer_id` when `target_id`
    /// goes idle, or after `timeout_s` seconds, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if either session is unknown.
    pub async fn watch(&self, target_id: &str, observer_id: &str, timeout_s: u64) -> Result<()> {
        // Validate both ends up front so a typo fails loudly.
        let target = self.registry.resolve(target_id).await?;
        let observer = self.registry.resolve(observer_id).await?;

        // Fresh watches must not resolve on a stale idle flag.
        self.tracker.mark_active(&target.id).await;

        let cancel = self.root_cancel.child_token();
        self.tasks
            .lock()
            .await
            .entry(target.id.clone())
            .or_default()
            .push(cancel.clone());

        info!(target_id = %target.id, observer_id = %observer.id, timeout_s, "watch registered");
        tokio::spawn(run_watch(
            Arc::clone(&self.registry),
            Arc::clone(&self.tracker),
            Arc::clone(&self.engine),
            target.id,
            observer.id,
            Duration::from_secs(timeout_s),
            self.poll_interval,
            cancel,
        ));
        Ok(())
    }

    /// Cancel every watch aimed at a target (session kill path).
    pub async fn cancel_for(&self, target_id: &str) {
        if let Some(tokens) = self.tasks.lock().await.remove(target_id) {
            for token in tokens {
                token.cancel();
            }
            debug!(target_id, "watches cancelled");
        }
    }
}

/// Poll loop for one watch registration.
#[allow(clippy::too_many_arguments)] // Internal plumbing; not public API width.
async fn run_watch(
    registry: Arc<SessionRegistry>,
    tracker: Arc<IdleTracker>,
    engine: Arc<DeliveryEngine>,
    target_id: String,
    observer_id: String,
    timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target_id, "watch cancelled");
                return;
            }
            () = tokio::time::sleep(poll_interval) => {}
        }

        let Some(session) = registry.get(&target_id).await else {
            debug!(target_id, "watch target gone");
            return;
        };

        // Hook-less providers may only surface idleness through the
        // external status maintained by prompt inspection.
        let idle = tracker.is_idle(&target_id).await
            || (session.provider == Provider::CodexTmux
                && session.status == SessionStatus::Idle);

        if idle {
            notify(&engine, &observer_id, &target_id, true).await;
            return;
        }

        if tokio::time::Instant::now() >= deadline {
            notify(&engine, &observer_id, &target_id, false).await;
            return;
        }
    }
}

async fn notify(engine: &Arc<DeliveryEngine>, observer_id: &str, target_id: &str, idle: bool) {
    let text = if idle {
        format!("watch: {target_id} is idle")
    } else {
        format!("watch: timed out waiting for {target_id} to go idle")
    };
    let request = EnqueueRequest {
        target_id: observer_id.to_owned(),
        text,
        mode: DeliveryMode::Sequential,
        ..EnqueueRequest::default()
    };
    if let Err(err) = engine.enqueue(request).await {
        warn!(observer_id, target_id, %err, "failed to queue watch notification");
    }
}
