//! Shared test helpers for integration tests.
//!
//! Provides a recording mock terminal driver and a fully wired core
//! (in-memory databases, temp state file, fast timer configuration) so
//! individual test modules can focus on behaviour rather than
//! boilerplate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_relay::config::GlobalConfig;
use agent_relay::driver::{DriverFuture, TerminalDriver};
use agent_relay::models::session::{Provider, Session, SessionStatus};
use agent_relay::orchestrator::delivery::DeliveryEngine;
use agent_relay::orchestrator::handoff::HandoffCoordinator;
use agent_relay::orchestrator::registry::SessionRegistry;
use agent_relay::orchestrator::reminders::{spawn_reminder_consumer, ReminderScheduler};
use agent_relay::orchestrator::tracker::IdleTracker;
use agent_relay::orchestrator::watchers::WatcherSet;
use agent_relay::orchestrator::{Core, CreateSessionParams};
use agent_relay::persistence::db;
use agent_relay::persistence::queue_repo::{QueueRepo, WakeRepo};
use agent_relay::persistence::tool_events::ToolEventRepo;

/// One recorded driver invocation.
#[derive(Debug, Clone)]
pub struct DriverCall {
    pub pane: String,
    pub kind: DriverCallKind,
    pub at: Instant,
}

/// Which driver operation was invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCallKind {
    LiteralText(String),
    SubmitKey,
    CancelKey,
    Capture,
    CreatePane,
    KillPane,
    PipePane,
}

/// Recording driver: every call lands in `calls` with a timestamp, and
/// `capture_pane` returns whatever the test configured.
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    capture: Mutex<String>,
    exists: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            capture: Mutex::new("agent output\n> \n".to_owned()),
            exists: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Set the text returned by `capture_pane`.
    pub fn set_capture(&self, text: &str) {
        *self.capture.lock().expect("capture lock") = text.to_owned();
    }

    /// Make pane existence checks return `alive`.
    pub fn set_exists(&self, alive: bool) {
        self.exists.store(alive, Ordering::SeqCst);
    }

    /// Make literal/submit/cancel sends fail.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of all recorded calls.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// All literal texts injected into a pane, in order.
    pub fn injected_texts(&self, pane: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.pane == pane)
            .filter_map(|c| match c.kind {
                DriverCallKind::LiteralText(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Injection-relevant calls (text, submit, cancel) for a pane.
    pub fn injection_calls(&self, pane: &str) -> Vec<DriverCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.pane == pane
                    && matches!(
                        c.kind,
                        DriverCallKind::LiteralText(_)
                            | DriverCallKind::SubmitKey
                            | DriverCallKind::CancelKey
                    )
            })
            .collect()
    }

    fn record(&self, pane: &str, kind: DriverCallKind) {
        self.calls.lock().expect("calls lock").push(DriverCall {
            pane: pane.to_owned(),
            kind,
            at: Instant::now(),
        });
    }

    fn send_result(&self) -> agent_relay::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(agent_relay::AppError::Driver("mock send failure".into()))
        } else {
            Ok(())
        }
    }
}

impl TerminalDriver for MockDriver {
    fn send_literal_text<'a>(&'a self, pane: &'a str, text: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::LiteralText(text.to_owned()));
            self.send_result()
        })
    }

    fn send_submit_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::SubmitKey);
            self.send_result()
        })
    }

    fn send_cancel_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::CancelKey);
            self.send_result()
        })
    }

    fn capture_pane<'a>(&'a self, pane: &'a str, _from_start: bool) -> DriverFuture<'a, String> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::Capture);
            Ok(self.capture.lock().expect("capture lock").clone())
        })
    }

    fn create_pane<'a>(
        &'a self,
        pane: &'a str,
        _working_dir: &'a str,
        _command: &'a str,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::CreatePane);
            Ok(())
        })
    }

    fn kill_pane<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::KillPane);
            Ok(())
        })
    }

    fn exists<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::Capture);
            Ok(self.exists.load(Ordering::SeqCst))
        })
    }

    fn pipe_pane<'a>(&'a self, pane: &'a str, _log_file: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.record(pane, DriverCallKind::PipePane);
            Ok(())
        })
    }
}

/// A fully wired core against the mock driver.
pub struct TestHarness {
    pub core: Arc<Core>,
    pub driver: Arc<MockDriver>,
    pub queue: QueueRepo,
    pub wake_repo: WakeRepo,
    pub cancel: CancellationToken,
    _tmp: tempfile::TempDir,
}

/// Build a harness with the default 8 s skip-fence TTL.
pub async fn harness() -> TestHarness {
    harness_with_fence(Duration::from_secs(8)).await
}

/// Build a harness with a custom skip-fence TTL and fast timers.
pub async fn harness_with_fence(fence_ttl: Duration) -> TestHarness {
    let tmp = tempfile::tempdir().expect("tempdir");

    let mut config = GlobalConfig::default();
    config.data_dir = Some(tmp.path().to_path_buf());
    config.pipe_log_dir = tmp.path().join("pipe-logs");
    config.delivery.urgent_prompt_timeout_s = 1;
    config.delivery.urgent_poll_ms = 50;
    config.remind.poll_interval_s = 1;
    config.remind.wake_period_s = 1;
    config.remind.wake_escalated_period_s = 1;
    config.remind.compaction_wait_ceiling_s = 2;
    let config = Arc::new(config);

    let queue_db = Arc::new(db::connect_memory().await.expect("queue db"));
    let obs_db = Arc::new(db::connect_memory().await.expect("obs db"));
    let queue_repo = QueueRepo::new(Arc::clone(&queue_db));
    let wake_repo = WakeRepo::new(Arc::clone(&queue_db));
    let exposed_queue = queue_repo.clone();
    let exposed_wake = wake_repo.clone();
    let tool_events = ToolEventRepo::new(Arc::clone(&obs_db))
        .await
        .expect("tool events");

    let cancel = CancellationToken::new();
    let registry = Arc::new(
        SessionRegistry::load(config.state_file())
            .await
            .expect("registry"),
    );
    let tracker = Arc::new(IdleTracker::new(fence_ttl));
    let driver = MockDriver::new();
    let driver_dyn: Arc<dyn TerminalDriver> = Arc::<MockDriver>::clone(&driver);

    let (remind_tx, remind_rx) = mpsc::channel(64);
    let scheduler = Arc::new(ReminderScheduler::new(
        Arc::clone(&registry),
        tool_events.clone(),
        wake_repo,
        remind_tx,
        config.remind.clone(),
        cancel.child_token(),
    ));

    let engine = Arc::new(DeliveryEngine::new(
        Arc::clone(&registry),
        Arc::clone(&tracker),
        queue_repo,
        Arc::clone(&driver_dyn),
        Arc::clone(&scheduler),
        Duration::from_millis(config.delivery.settle_ms),
        Duration::from_secs(config.delivery.urgent_prompt_timeout_s),
        Duration::from_millis(config.delivery.urgent_poll_ms),
        config.handoff_dir(),
    ));
    let _consumer = spawn_reminder_consumer(remind_rx, Arc::clone(&engine), cancel.clone());

    let watchers = Arc::new(WatcherSet::new(
        Arc::clone(&registry),
        Arc::clone(&tracker),
        Arc::clone(&engine),
        Duration::from_millis(100),
        cancel.child_token(),
    ));
    let handoff = HandoffCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&tracker),
        Arc::clone(&driver_dyn),
        Arc::clone(&engine),
        config.handoff_dir(),
    );

    let core = Arc::new(Core {
        config,
        registry,
        tracker,
        engine,
        scheduler,
        watchers,
        handoff,
        driver: driver_dyn,
        tool_events,
        telegram: None,
        remote_tx: None,
    });

    TestHarness {
        core,
        driver,
        queue: exposed_queue,
        wake_repo: exposed_wake,
        cancel,
        _tmp: tmp,
    }
}

/// Spawn a session through the core.
pub async fn add_session(core: &Arc<Core>, provider: Provider, name: &str) -> Session {
    core.create_session(CreateSessionParams {
        provider,
        working_dir: "/tmp/workspace".into(),
        parent_id: None,
        friendly_name: Some(name.to_owned()),
        is_em: false,
    })
    .await
    .expect("create session")
}

/// Put a session into the idle state (flag plus external status).
pub async fn make_idle(core: &Arc<Core>, session_id: &str) {
    core.tracker.mark_idle(session_id).await;
    let _ = core
        .registry
        .update_status(session_id, SessionStatus::Idle)
        .await;
}

/// Sleep long enough for spawned delivery tasks (including the 300 ms
/// settle) to finish.
pub async fn settle_deliveries() {
    tokio::time::sleep(Duration::from_millis(700)).await;
}
