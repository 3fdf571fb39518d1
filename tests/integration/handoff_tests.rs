//! Handoff protocol: fence arming, the pending-path branch, lost-hook
//! TTL recovery, and injection-failure abandonment.

use std::path::Path;
use std::time::Duration;

use agent_relay::models::session::{Provider, SessionStatus};

use super::test_helpers::{add_session, harness, harness_with_fence, settle_deliveries};

#[tokio::test]
async fn handoff_arms_fence_and_issues_clear() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "handoff").await;

    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/resume.md"))
        .await
        .expect("handoff");

    let state = h.core.tracker.state(&session.id).await.expect("state");
    assert_eq!(state.stop_notify_skip_count, 1);
    assert!(state.skip_count_armed_at.is_some());
    assert_eq!(
        state.pending_handoff_path.as_deref(),
        Some(Path::new("/tmp/resume.md"))
    );

    let texts = h.driver.injected_texts(session.pane_ref());
    assert!(
        texts.iter().any(|t| t == "/clear"),
        "clear must be injected, got {texts:?}"
    );
}

#[tokio::test]
async fn clear_hook_is_absorbed_and_triggers_the_wake() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "wake").await;

    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/resume.md"))
        .await
        .expect("handoff");

    // The /clear stop hook arrives a moment later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.core.engine.handle_stop_signal(&session.id, None).await;
    settle_deliveries().await;

    // Absorbed: the session never went idle, status stays Running.
    assert!(!h.core.tracker.is_idle(&session.id).await);
    let current = h.core.registry.get(&session.id).await.expect("session");
    assert_eq!(current.status, SessionStatus::Running);

    // Fence fully drained.
    let state = h.core.tracker.state(&session.id).await.expect("state");
    assert_eq!(state.stop_notify_skip_count, 0);
    assert!(state.skip_count_armed_at.is_none());
    assert!(state.pending_handoff_path.is_none());

    // The wake message re-primed the agent with the continuation path.
    let texts = h.driver.injected_texts(session.pane_ref());
    assert!(
        texts.iter().any(|t| t.contains("/tmp/resume.md")),
        "wake message must reference the continuation path, got {texts:?}"
    );
}

#[tokio::test]
async fn lost_clear_hook_resets_fence_after_ttl() {
    let h = harness_with_fence(Duration::from_millis(100)).await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "lost-hook").await;

    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/resume-c.md"))
        .await
        .expect("handoff");

    // No hook arrives within the TTL; a genuine stop lands later.
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.core.engine.handle_stop_signal(&session.id, None).await;
    settle_deliveries().await;

    // Fence reset, then a normal idle transition.
    let state = h.core.tracker.state(&session.id).await.expect("state");
    assert_eq!(state.stop_notify_skip_count, 0);
    assert!(state.skip_count_armed_at.is_none());
    assert!(state.is_idle);
    let current = h.core.registry.get(&session.id).await.expect("session");
    assert_eq!(current.status, SessionStatus::Idle);

    // The abandoned handoff never queues its wake.
    let texts = h.driver.injected_texts(session.pane_ref());
    assert!(
        !texts.iter().any(|t| t.contains("resume-c.md")),
        "no wake message after a lost clear hook, got {texts:?}"
    );
}

#[tokio::test]
async fn failed_clear_injection_abandons_the_handoff() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "abandoned").await;
    h.driver.set_fail_sends(true);

    let result = h
        .core
        .handoff
        .run(&session.id, Path::new("/tmp/never.md"))
        .await;
    assert!(result.is_err(), "failed clear must surface");

    let state = h.core.tracker.state(&session.id).await.expect("state");
    assert!(
        state.pending_handoff_path.is_none(),
        "abandoned handoff must not leave a pending wake"
    );
    // The fence stays armed and drains by TTL on its own.
    assert_eq!(state.stop_notify_skip_count, 1);
}

#[tokio::test]
async fn handoff_writes_a_scrollback_snapshot() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "snapshot").await;
    h.driver.set_capture("full scrollback contents\n> \n");

    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/resume.md"))
        .await
        .expect("handoff");

    let handoff_dir = h.core.config.handoff_dir();
    let mut found = false;
    if let Ok(entries) = std::fs::read_dir(&handoff_dir) {
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{}-", session.id))
            {
                let dump = entry.path().join("dump.txt");
                let contents = std::fs::read_to_string(dump).expect("dump readable");
                assert!(contents.contains("full scrollback contents"));
                found = true;
            }
        }
    }
    assert!(found, "scrollback dump must be written under {handoff_dir:?}");
}

#[tokio::test]
async fn handoff_on_stopped_session_is_rejected() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "stopped").await;
    h.core.kill_session(&session.id).await.expect("kill");

    let result = h
        .core
        .handoff
        .run(&session.id, Path::new("/tmp/r.md"))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn consecutive_handoffs_stack_the_fence() {
    let h = harness().await;
    let session = add_session(&h.core, Provider::ClaudeTmux, "double").await;

    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/one.md"))
        .await
        .expect("first handoff");
    h.core
        .handoff
        .run(&session.id, Path::new("/tmp/two.md"))
        .await
        .expect("second handoff");

    let state = h.core.tracker.state(&session.id).await.expect("state");
    assert_eq!(
        state.stop_notify_skip_count, 2,
        "each handoff absorbs its own clear hook"
    );
    // The later continuation wins.
    assert_eq!(
        state.pending_handoff_path.as_deref(),
        Some(Path::new("/tmp/two.md"))
    );
}
