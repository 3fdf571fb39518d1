//! Session registry: identifier resolution, the status state machine,
//! and snapshot persistence.

use agent_relay::models::session::{Provider, Session, SessionStatus};
use agent_relay::orchestrator::registry::{EmTopic, SessionRegistry};
use agent_relay::AppError;

async fn fresh_registry() -> (SessionRegistry, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let registry = SessionRegistry::load(tmp.path().join("sessions.json"))
        .await
        .expect("load");
    (registry, tmp)
}

fn session(name: &str) -> Session {
    let mut s = Session::new(Provider::ClaudeTmux, "/tmp/work".into());
    s.friendly_name = Some(name.to_owned());
    s
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let (registry, _tmp) = fresh_registry().await;
    let created = registry.create(session("alpha")).await.expect("create");
    let fetched = registry.get(&created.id).await.expect("get");
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn resolve_accepts_exact_id_prefix_and_friendly_name() {
    let (registry, _tmp) = fresh_registry().await;
    let created = registry.create(session("builder")).await.expect("create");

    let by_id = registry.resolve(&created.id).await.expect("by id");
    assert_eq!(by_id.id, created.id);

    let by_prefix = registry.resolve(&created.id[..4]).await.expect("by prefix");
    assert_eq!(by_prefix.id, created.id);

    let by_name = registry.resolve("builder").await.expect("by name");
    assert_eq!(by_name.id, created.id);
}

#[tokio::test]
async fn ambiguous_prefix_is_rejected() {
    let (registry, _tmp) = fresh_registry().await;
    let mut a = session("one");
    a.id = "abc11111".into();
    let mut b = session("two");
    b.id = "abc22222".into();
    registry.create(a).await.expect("create a");
    registry.create(b).await.expect("create b");

    let result = registry.resolve("abc").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn unknown_identifier_is_not_found() {
    let (registry, _tmp) = fresh_registry().await;
    assert!(matches!(
        registry.resolve("nothing").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn status_updates_respect_the_state_machine() {
    let (registry, _tmp) = fresh_registry().await;
    let created = registry.create(session("fsm")).await.expect("create");

    registry
        .update_status(&created.id, SessionStatus::Idle)
        .await
        .expect("to idle");
    registry
        .update_status(&created.id, SessionStatus::Stopped)
        .await
        .expect("to stopped");

    let result = registry
        .update_status(&created.id, SessionStatus::Running)
        .await;
    assert!(
        matches!(result, Err(AppError::InvalidState(_))),
        "stopped is terminal, got {result:?}"
    );
}

#[tokio::test]
async fn same_status_update_is_a_noop() {
    let (registry, _tmp) = fresh_registry().await;
    let created = registry.create(session("noop")).await.expect("create");
    registry
        .update_status(&created.id, SessionStatus::Running)
        .await
        .expect("same status is fine");
}

#[tokio::test]
async fn snapshot_survives_a_reload() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("sessions.json");

    let first = SessionRegistry::load(path.clone()).await.expect("load");
    let created = first.create(session("durable")).await.expect("create");
    first
        .set_em_topic(Some(EmTopic {
            chat_id: 42,
            thread_id: Some(7),
        }))
        .await
        .expect("set topic");

    let second = SessionRegistry::load(path).await.expect("reload");
    let restored = second.get(&created.id).await.expect("restored");
    assert_eq!(restored.friendly_name.as_deref(), Some("durable"));
    assert_eq!(
        second.em_topic().await,
        Some(EmTopic {
            chat_id: 42,
            thread_id: Some(7),
        })
    );
}

#[tokio::test]
async fn snapshot_with_missing_fields_defaults() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("sessions.json");
    std::fs::write(&path, "{}").expect("write bare snapshot");

    let registry = SessionRegistry::load(path).await.expect("load");
    assert!(registry.list().await.is_empty());
    assert_eq!(registry.em_topic().await, None);
}

#[tokio::test]
async fn remove_deletes_the_session() {
    let (registry, _tmp) = fresh_registry().await;
    let created = registry.create(session("gone")).await.expect("create");
    registry.remove(&created.id).await.expect("remove");
    assert!(registry.get(&created.id).await.is_none());
    assert!(matches!(
        registry.remove(&created.id).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_mutates_and_persists() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("sessions.json");
    let registry = SessionRegistry::load(path.clone()).await.expect("load");
    let created = registry.create(session("mutable")).await.expect("create");

    registry
        .update(&created.id, |s| s.tokens_used = Some(12_345))
        .await
        .expect("update");

    let reloaded = SessionRegistry::load(path).await.expect("reload");
    let restored = reloaded.get(&created.id).await.expect("restored");
    assert_eq!(restored.tokens_used, Some(12_345));
}
