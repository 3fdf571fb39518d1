//! Crash recovery: queue reconciliation, dead-pane detection, and
//! persisted wake registrations.

use agent_relay::models::message::{DeliveryMode, QueuedMessage};
use agent_relay::models::remind::ParentWakeRegistration;
use agent_relay::models::session::{Provider, SessionStatus};
use agent_relay::orchestrator::delivery::EnqueueRequest;

use super::test_helpers::{add_session, harness, make_idle};

#[tokio::test]
async fn recovery_discards_rows_for_missing_targets() {
    let h = harness().await;
    let live = add_session(&h.core, Provider::ClaudeTmux, "live").await;
    h.core.tracker.mark_active(&live.id).await;

    h.core
        .engine
        .enqueue(EnqueueRequest {
            target_id: live.id.clone(),
            text: "survives recovery".into(),
            mode: DeliveryMode::Sequential,
            ..EnqueueRequest::default()
        })
        .await
        .expect("enqueue");

    // A row left behind by a session that no longer exists.
    let orphan = QueuedMessage::new("ghost999".into(), "orphaned".into(), DeliveryMode::Sequential);
    h.queue.insert(&orphan).await.expect("insert orphan");

    h.core.recover().await;

    assert_eq!(
        h.queue.pending_count("ghost999").await.unwrap(),
        0,
        "orphaned rows are discarded"
    );
    assert_eq!(
        h.queue.pending_count(&live.id).await.unwrap(),
        1,
        "rows with a live target wait for the next idle signal"
    );
}

#[tokio::test]
async fn recovered_rows_flush_on_the_next_idle_signal() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "re-flush").await;
    h.core.tracker.mark_active(&session.id).await;

    h.core
        .engine
        .enqueue(EnqueueRequest {
            target_id: session.id.clone(),
            text: "delivered after restart".into(),
            mode: DeliveryMode::Sequential,
            ..EnqueueRequest::default()
        })
        .await
        .expect("enqueue");

    h.core.recover().await;
    make_idle(&h.core, &session.id).await;
    h.core.engine.flush_target(&session.id, false).await;

    assert_eq!(
        h.driver.injected_texts(session.pane_ref()),
        vec!["delivered after restart"]
    );
}

#[tokio::test]
async fn dead_pane_marks_the_session_stopped() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "dead-pane").await;
    h.driver.set_exists(false);

    h.core.recover().await;

    let current = h.core.registry.get(&session.id).await.expect("session");
    assert_eq!(current.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn active_wake_registrations_are_recovered() {
    let h = harness().await;
    let em = add_session(&h.core, Provider::ClaudeTmux, "em-recover").await;
    let child = add_session(&h.core, Provider::ClaudeTmux, "child-recover").await;

    // Registration persisted by a previous process life.
    let reg = ParentWakeRegistration::new(child.id.clone(), em.id.clone(), 600);
    h.wake_repo.upsert(&reg).await.expect("upsert");

    assert!(!h.core.scheduler.has_parent_wake(&child.id).await);
    h.core.scheduler.recover_parent_wakes().await;
    assert!(h.core.scheduler.has_parent_wake(&child.id).await);
}

#[tokio::test]
async fn cancelled_wake_registrations_stay_cancelled() {
    let h = harness().await;
    let em = add_session(&h.core, Provider::ClaudeTmux, "em-gone").await;

    let reg = ParentWakeRegistration::new("vanished1".into(), em.id.clone(), 600);
    h.wake_repo.upsert(&reg).await.expect("upsert");
    h.wake_repo.deactivate("vanished1").await.expect("deactivate");

    h.core.scheduler.recover_parent_wakes().await;
    assert!(!h.core.scheduler.has_parent_wake("vanished1").await);
}

#[tokio::test]
async fn wake_for_a_dead_child_is_deactivated_on_recovery() {
    let h = harness().await;
    let em = add_session(&h.core, Provider::ClaudeTmux, "em-dead-child").await;
    let child = add_session(&h.core, Provider::ClaudeTmux, "dead-child").await;

    let reg = ParentWakeRegistration::new(child.id.clone(), em.id.clone(), 600);
    h.wake_repo.upsert(&reg).await.expect("upsert");
    h.core.kill_session(&child.id).await.expect("kill");

    h.core.scheduler.recover_parent_wakes().await;
    assert!(!h.core.scheduler.has_parent_wake(&child.id).await);

    let active = h.wake_repo.list_active().await.expect("list");
    assert!(
        !active.iter().any(|r| r.child_id == child.id),
        "registration for a stopped child is deactivated"
    );
}
