//! Queue repository: FIFO ordering, delivery stamps, category-scoped
//! cancellation, and purge behaviour.

use std::sync::Arc;

use agent_relay::models::message::{DeliveryMode, MessageCategory, QueuedMessage};
use agent_relay::persistence::{db, queue_repo::QueueRepo};
use chrono::{Duration, Utc};

async fn repo() -> QueueRepo {
    let pool = db::connect_memory().await.expect("db");
    QueueRepo::new(Arc::new(pool))
}

fn message(target: &str, text: &str) -> QueuedMessage {
    QueuedMessage::new(target.to_owned(), text.to_owned(), DeliveryMode::Sequential)
}

#[tokio::test]
async fn insert_round_trips_every_field() {
    let repo = repo().await;
    let mut msg = message("t1", "hello");
    msg.sender_id = Some("sender".into());
    msg.parent_id = Some("parent".into());
    msg.mode = DeliveryMode::Important;
    msg.category = Some(MessageCategory::ContextMonitor);
    msg.remind_soft_s = Some(210);
    msg.remind_hard_s = Some(420);
    msg.notify_on_stop = true;
    repo.insert(&msg).await.expect("insert");

    let pending = repo.pending_for_target("t1").await.expect("pending");
    assert_eq!(pending.len(), 1);
    let restored = &pending[0];
    assert_eq!(restored.sender_id.as_deref(), Some("sender"));
    assert_eq!(restored.parent_id.as_deref(), Some("parent"));
    assert_eq!(restored.mode, DeliveryMode::Important);
    assert_eq!(restored.category, Some(MessageCategory::ContextMonitor));
    assert_eq!(restored.remind_soft_s, Some(210));
    assert_eq!(restored.remind_hard_s, Some(420));
    assert!(restored.notify_on_stop);
    assert!(restored.delivered_at.is_none());
}

#[tokio::test]
async fn pending_messages_come_back_fifo_by_queue_time() {
    let repo = repo().await;
    let now = Utc::now();
    for (offset, text) in [(2, "third"), (0, "first"), (1, "second")] {
        let mut msg = message("t2", text);
        msg.queued_at = now + Duration::seconds(offset);
        repo.insert(&msg).await.expect("insert");
    }

    let pending = repo.pending_for_target("t2").await.expect("pending");
    let texts: Vec<&str> = pending.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn delivered_messages_leave_the_pending_set() {
    let repo = repo().await;
    let msg = message("t3", "one-shot");
    repo.insert(&msg).await.expect("insert");

    repo.mark_delivered(&msg.id, Utc::now()).await.expect("mark");
    assert_eq!(repo.pending_count("t3").await.unwrap(), 0);
    assert!(repo.pending_for_target("t3").await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_scopes_to_sender_and_category() {
    let repo = repo().await;

    let mut monitor = message("em", "context at 80%");
    monitor.sender_id = Some("agent-a".into());
    monitor.category = Some(MessageCategory::ContextMonitor);
    repo.insert(&monitor).await.expect("insert monitor");

    let mut user_msg = message("em", "done with refactor");
    user_msg.sender_id = Some("agent-a".into());
    repo.insert(&user_msg).await.expect("insert user");

    let mut other = message("em", "context at 90%");
    other.sender_id = Some("agent-b".into());
    other.category = Some(MessageCategory::ContextMonitor);
    repo.insert(&other).await.expect("insert other");

    let cancelled = repo
        .cancel_context_monitor_from("agent-a")
        .await
        .expect("cancel");
    assert_eq!(cancelled, 1);

    let remaining = repo.pending_for_target("em").await.expect("pending");
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().any(|m| m.text == "done with refactor"));
    assert!(remaining.iter().any(|m| m.text == "context at 90%"));
}

#[tokio::test]
async fn cancel_leaves_delivered_monitor_rows_alone() {
    let repo = repo().await;
    let mut msg = message("em", "already seen");
    msg.sender_id = Some("agent-a".into());
    msg.category = Some(MessageCategory::ContextMonitor);
    repo.insert(&msg).await.expect("insert");
    repo.mark_delivered(&msg.id, Utc::now()).await.expect("mark");

    let cancelled = repo
        .cancel_context_monitor_from("agent-a")
        .await
        .expect("cancel");
    assert_eq!(cancelled, 0, "cancel targets undelivered rows only");
}

#[tokio::test]
async fn discard_drops_all_pending_for_a_target() {
    let repo = repo().await;
    repo.insert(&message("t4", "a")).await.expect("insert");
    repo.insert(&message("t4", "b")).await.expect("insert");
    repo.insert(&message("t5", "c")).await.expect("insert");

    let dropped = repo.discard_pending_for_target("t4").await.expect("discard");
    assert_eq!(dropped, 2);
    assert_eq!(repo.pending_count("t4").await.unwrap(), 0);
    assert_eq!(repo.pending_count("t5").await.unwrap(), 1);
}

#[tokio::test]
async fn pending_targets_lists_distinct_targets() {
    let repo = repo().await;
    repo.insert(&message("t6", "x")).await.expect("insert");
    repo.insert(&message("t6", "y")).await.expect("insert");
    repo.insert(&message("t7", "z")).await.expect("insert");

    let mut targets = repo.pending_targets().await.expect("targets");
    targets.sort();
    assert_eq!(targets, vec!["t6".to_owned(), "t7".to_owned()]);
}

#[tokio::test]
async fn purge_removes_only_old_delivered_rows() {
    let repo = repo().await;

    let old = message("t8", "ancient");
    repo.insert(&old).await.expect("insert");
    repo.mark_delivered(&old.id, Utc::now() - Duration::days(60))
        .await
        .expect("mark");

    let recent = message("t8", "recent");
    repo.insert(&recent).await.expect("insert");
    repo.mark_delivered(&recent.id, Utc::now()).await.expect("mark");

    let still_pending = message("t8", "pending");
    repo.insert(&still_pending).await.expect("insert");

    let purged = repo
        .purge_delivered(Utc::now() - Duration::days(30))
        .await
        .expect("purge");
    assert_eq!(purged, 1, "only the old delivered row is purged");
    assert_eq!(repo.pending_count("t8").await.unwrap(), 1);
}
