//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting delivered queue rows and old
//! tool events once they are older than `retention_days`.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::queue_repo::QueueRepo;
use super::tool_events::ToolEventRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it purges delivered messages and
/// tool events older than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    queue: QueueRepo,
    tool_events: ToolEventRepo,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&queue, &tool_events, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

async fn purge(queue: &QueueRepo, tool_events: &ToolEventRepo, retention_days: u32) -> Result<()> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let messages = queue.purge_delivered(cutoff).await?;
    let events = tool_events.purge(cutoff).await?;
    info!(retention_days, messages, events, "retention purge completed");
    Ok(())
}
