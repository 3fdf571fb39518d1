//! Idle tracker: the skip fence, cache invalidation, prompt matching,
//! and the bounded transcript-read retries.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use agent_relay::orchestrator::tracker::{prompt_shows_idle, IdleTracker, StopDisposition};

fn tracker() -> IdleTracker {
    IdleTracker::new(Duration::from_secs(8))
}

// ─── Skip fence ───────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_fence_absorbs_the_stop_signal() {
    let t = tracker();
    t.arm_skip_fence("s1").await;

    let disposition = t.apply_stop_signal("s1").await;
    assert_eq!(disposition, StopDisposition::Absorbed);

    let state = t.state("s1").await.expect("state");
    assert_eq!(state.stop_notify_skip_count, 0);
    assert!(state.skip_count_armed_at.is_none(), "fence cleared on drain");
    assert!(!state.is_idle, "absorbed stop must not mark idle");
}

#[tokio::test]
async fn expired_fence_resets_then_processes_normally() {
    let t = IdleTracker::new(Duration::from_millis(50));
    t.arm_skip_fence("s2").await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let disposition = t.apply_stop_signal("s2").await;
    assert_eq!(disposition, StopDisposition::Idle);

    let state = t.state("s2").await.expect("state");
    assert_eq!(state.stop_notify_skip_count, 0);
    assert!(state.skip_count_armed_at.is_none());
    assert!(state.is_idle);
}

#[tokio::test]
async fn stacked_fence_absorbs_each_clear_hook() {
    let t = tracker();
    t.arm_skip_fence("s3").await;
    t.arm_skip_fence("s3").await;
    assert_eq!(t.state("s3").await.unwrap().stop_notify_skip_count, 2);

    assert_eq!(t.apply_stop_signal("s3").await, StopDisposition::Absorbed);
    assert_eq!(t.state("s3").await.unwrap().stop_notify_skip_count, 1);
    assert_eq!(t.apply_stop_signal("s3").await, StopDisposition::Absorbed);
    assert_eq!(t.apply_stop_signal("s3").await, StopDisposition::Idle);
}

#[tokio::test]
async fn pending_handoff_routes_the_absorbed_stop_to_the_wake_branch() {
    let t = tracker();
    t.arm_skip_fence("s4").await;
    t.set_pending_handoff("s4", PathBuf::from("/tmp/resume.md"))
        .await;

    let disposition = t.apply_stop_signal("s4").await;
    assert_eq!(
        disposition,
        StopDisposition::HandoffWake(PathBuf::from("/tmp/resume.md"))
    );

    let state = t.state("s4").await.expect("state");
    assert!(state.pending_handoff_path.is_none(), "path consumed");
    assert!(!state.is_idle, "wake branch keeps the session running");
}

#[tokio::test]
async fn expired_fence_also_drops_the_pending_handoff() {
    let t = IdleTracker::new(Duration::from_millis(50));
    t.arm_skip_fence("s5").await;
    t.set_pending_handoff("s5", PathBuf::from("/tmp/stale.md"))
        .await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(t.apply_stop_signal("s5").await, StopDisposition::Idle);
    let state = t.state("s5").await.expect("state");
    assert!(state.pending_handoff_path.is_none());
}

#[tokio::test]
async fn urgent_and_delivery_clear_the_idle_flag() {
    let t = tracker();
    t.mark_idle("s6").await;
    assert!(t.is_idle("s6").await);
    t.mark_active("s6").await;
    assert!(!t.is_idle("s6").await);
}

// ─── Cache invalidation (session clear path) ──────────────────────────

#[tokio::test]
async fn invalidate_with_arm_skip_creates_state_and_arms() {
    let t = tracker();
    assert!(t.state("new1").await.is_none());

    t.invalidate("new1", true).await;

    let state = t.state("new1").await.expect("state created");
    assert_eq!(state.stop_notify_skip_count, 1);
}

#[tokio::test]
async fn invalidate_without_arm_skip_does_not_create_state() {
    let t = tracker();
    t.invalidate("absent", false).await;
    assert!(t.state("absent").await.is_none());
}

#[tokio::test]
async fn invalidate_clears_sender_ownership_hints() {
    let t = tracker();
    t.arm_stop_notify("s7", "em-1").await;
    t.invalidate("s7", false).await;
    let state = t.state("s7").await.expect("state");
    assert!(state.stop_notify_sender_id.is_none());

    t.arm_stop_notify("s7", "em-2").await;
    t.invalidate("s7", true).await;
    let state = t.state("s7").await.expect("state");
    assert!(state.stop_notify_sender_id.is_none());
    assert_eq!(state.stop_notify_skip_count, 1);
}

#[tokio::test]
async fn absorbed_stop_preserves_the_armed_sender() {
    // The late /clear hook must not steal the armed notification.
    let t = tracker();
    t.invalidate("s8", true).await;
    t.arm_stop_notify("s8", "em-parent").await;

    assert_eq!(t.apply_stop_signal("s8").await, StopDisposition::Absorbed);
    let state = t.state("s8").await.expect("state");
    assert_eq!(state.stop_notify_sender_id.as_deref(), Some("em-parent"));

    // The genuine stop afterwards consumes it.
    assert_eq!(t.apply_stop_signal("s8").await, StopDisposition::Idle);
    assert_eq!(t.take_stop_notify("s8").await.as_deref(), Some("em-parent"));
}

// ─── Prompt matching ──────────────────────────────────────────────────

#[test]
fn prompt_glyph_must_anchor_the_whole_line() {
    assert!(prompt_shows_idle("output\n>\n", ">"));
    assert!(prompt_shows_idle("output\n>   \n\n", ">"));
    assert!(!prompt_shows_idle("output\n> typed text", ">"));
    assert!(!prompt_shows_idle("a line mentioning > inline", ">"));
    assert!(prompt_shows_idle("codex ready\n›\n", "›"));
    assert!(!prompt_shows_idle("codex busy\n› draft", "›"));
}

// ─── Transcript-read retries ──────────────────────────────────────────

fn write_transcript(path: &std::path::Path, text: &str) {
    let mut file = std::fs::File::create(path).expect("create transcript");
    let line = serde_json::json!({
        "type": "assistant",
        "message": { "content": [ { "type": "text", "text": text } ] }
    });
    writeln!(file, "{line}").expect("write");
}

#[tokio::test]
async fn missing_transcript_gets_exactly_one_slow_retry() {
    let t = tracker();
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("never.jsonl");

    let started = Instant::now();
    let result = t
        .last_response_with_retries("r1", &path.to_string_lossy())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_none());
    assert!(
        elapsed >= Duration::from_millis(500),
        "empty read retries once after 500ms, took {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(900),
        "only one retry is allowed, took {elapsed:?}"
    );
}

#[tokio::test]
async fn late_transcript_flush_is_caught_by_the_retry() {
    let t = tracker();
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("late.jsonl");

    let writer_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        write_transcript(&writer_path, "finally flushed");
    });

    let result = t
        .last_response_with_retries("r2", &path.to_string_lossy())
        .await;
    assert_eq!(result.as_deref(), Some("finally flushed"));
}

#[tokio::test]
async fn stale_transcript_gets_exactly_one_fast_retry() {
    let t = tracker();
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("stale.jsonl");
    write_transcript(&path, "previous answer");

    // The tracker already stored this response from the prior turn.
    t.with_state("r3", |state| {
        state.last_response = Some("previous answer".into());
    })
    .await;

    let started = Instant::now();
    let result = t
        .last_response_with_retries("r3", &path.to_string_lossy())
        .await;
    let elapsed = started.elapsed();

    assert!(result.is_none(), "still-stale read yields no payload");
    assert!(
        elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(500),
        "stale read retries once after 300ms, took {elapsed:?}"
    );
}

#[tokio::test]
async fn stale_retry_picks_up_the_fresh_response() {
    let t = tracker();
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("fresh.jsonl");
    write_transcript(&path, "previous answer");

    t.with_state("r4", |state| {
        state.last_response = Some("previous answer".into());
    })
    .await;

    let writer_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        write_transcript(&writer_path, "fresh answer");
    });

    let result = t
        .last_response_with_retries("r4", &path.to_string_lossy())
        .await;
    assert_eq!(result.as_deref(), Some("fresh answer"));

    let state = t.state("r4").await.expect("state");
    assert_eq!(state.last_response.as_deref(), Some("fresh answer"));
}

#[tokio::test]
async fn fresh_response_needs_no_retry() {
    let t = tracker();
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("fast.jsonl");
    write_transcript(&path, "brand new");

    let started = Instant::now();
    let result = t
        .last_response_with_retries("r5", &path.to_string_lossy())
        .await;

    assert_eq!(result.as_deref(), Some("brand new"));
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "no retry on a fresh read"
    );
}
