#![forbid(unsafe_code)]

//! `agent-relay` — session orchestration daemon.
//!
//! Bootstraps configuration, the queue and observability databases, the
//! orchestration core, the HTTP control plane, and the Telegram gateway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::GlobalConfig;
use agent_relay::driver::tmux::TmuxDriver;
use agent_relay::driver::TerminalDriver;
use agent_relay::orchestrator::delivery::DeliveryEngine;
use agent_relay::orchestrator::handoff::HandoffCoordinator;
use agent_relay::orchestrator::registry::SessionRegistry;
use agent_relay::orchestrator::reminders::{self, ReminderScheduler};
use agent_relay::orchestrator::tracker::{self, IdleTracker};
use agent_relay::orchestrator::watchers::WatcherSet;
use agent_relay::orchestrator::Core;
use agent_relay::persistence::queue_repo::{QueueRepo, WakeRepo};
use agent_relay::persistence::tool_events::ToolEventRepo;
use agent_relay::persistence::{db, retention};
use agent_relay::telegram::{self, TelegramClient};
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Agent session orchestration daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. When the default path does
    /// not exist, built-in defaults are used.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the control-plane port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = if args.config.exists() {
        GlobalConfig::load_from_path(&args.config)?
    } else {
        info!(path = %args.config.display(), "no config file, using defaults");
        GlobalConfig::default()
    };
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    config.load_credentials()?;
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Databases and repos ─────────────────────────────
    let queue_db = Arc::new(db::connect(&config.queue_db_path()).await?);
    let observability_db = Arc::new(db::connect(&config.observability_db_path()).await?);
    let queue_repo = QueueRepo::new(Arc::clone(&queue_db));
    let wake_repo = WakeRepo::new(Arc::clone(&queue_db));
    let tool_events = ToolEventRepo::new(Arc::clone(&observability_db)).await?;
    info!("databases connected");

    // ── Core assembly, leaves first ─────────────────────
    let ct = CancellationToken::new();
    let registry = Arc::new(SessionRegistry::load(config.state_file()).await?);
    let idle_tracker = Arc::new(IdleTracker::new(Duration::from_secs(
        config.delivery.skip_fence_ttl_s,
    )));
    let driver: Arc<dyn TerminalDriver> = Arc::new(TmuxDriver::new());

    let (remind_tx, remind_rx) = mpsc::channel(64);
    let scheduler = Arc::new(ReminderScheduler::new(
        Arc::clone(&registry),
        tool_events.clone(),
        wake_repo,
        remind_tx,
        config.remind.clone(),
        ct.child_token(),
    ));

    let engine = Arc::new(DeliveryEngine::new(
        Arc::clone(&registry),
        Arc::clone(&idle_tracker),
        queue_repo.clone(),
        Arc::clone(&driver),
        Arc::clone(&scheduler),
        Duration::from_millis(config.delivery.settle_ms),
        Duration::from_secs(config.delivery.urgent_prompt_timeout_s),
        Duration::from_millis(config.delivery.urgent_poll_ms),
        config.handoff_dir(),
    ));
    let consumer_handle =
        reminders::spawn_reminder_consumer(remind_rx, Arc::clone(&engine), ct.clone());

    let watchers = Arc::new(WatcherSet::new(
        Arc::clone(&registry),
        Arc::clone(&idle_tracker),
        Arc::clone(&engine),
        Duration::from_secs(config.watch.poll_interval_s),
        ct.child_token(),
    ));
    let handoff = HandoffCoordinator::new(
        Arc::clone(&registry),
        Arc::clone(&idle_tracker),
        Arc::clone(&driver),
        Arc::clone(&engine),
        config.handoff_dir(),
    );

    // ── Telegram gateway (optional) ─────────────────────
    let (telegram_client, remote_tx, remote_rx) = if config.telegram.enabled {
        let client = Arc::new(TelegramClient::new(
            config.telegram.bot_token.clone(),
            Duration::from_secs(config.telegram.poll_total_timeout_s),
        ));
        let (tx, rx) = mpsc::channel(256);
        (Some(client), Some(tx), Some(rx))
    } else {
        info!("telegram gateway disabled");
        (None, None, None)
    };

    let core = Arc::new(Core {
        config: Arc::clone(&config),
        registry,
        tracker: Arc::clone(&idle_tracker),
        engine: Arc::clone(&engine),
        scheduler,
        watchers,
        handoff,
        driver: Arc::clone(&driver),
        tool_events: tool_events.clone(),
        telegram: telegram_client.clone(),
        remote_tx,
    });

    // ── Crash recovery ──────────────────────────────────
    core.recover().await;
    info!("startup recovery complete");

    // ── Background services ─────────────────────────────
    let retention_handle = retention::spawn_retention_task(
        queue_repo,
        tool_events,
        config.retention_days,
        ct.clone(),
    );
    let inspector_handle = tracker::spawn_prompt_inspector(
        Arc::clone(&core.registry),
        idle_tracker,
        engine,
        driver,
        Duration::from_secs(5),
        ct.clone(),
    );

    let mut gateway_handles = Vec::new();
    if let (Some(client), Some(rx)) = (telegram_client, remote_rx) {
        gateway_handles.push(telegram::spawn_gateway(
            Arc::clone(&core),
            Arc::clone(&client),
            config.telegram.clone(),
            ct.clone(),
        ));
        gateway_handles.push(telegram::spawn_outbound_sender(
            Arc::clone(&core),
            client,
            config.telegram.chat_id,
            rx,
            ct.clone(),
        ));
        info!("telegram gateway started");
    }

    // ── Control plane ───────────────────────────────────
    let http_core = Arc::clone(&core);
    let http_ct = ct.clone();
    let http_shutdown_ct = ct.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(err) = agent_relay::http::serve(http_core, config.http_port, http_ct).await {
            error!(%err, "control plane failed — initiating shutdown");
            http_shutdown_ct.cancel();
        }
    });

    info!("agent-relay ready");

    // ── Wait for shutdown ───────────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    let shutdown = async {
        let _ = http_handle.await;
        let _ = retention_handle.await;
        let _ = inspector_handle.await;
        let _ = consumer_handle.await;
        for handle in gateway_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(10), shutdown)
        .await
        .is_err()
    {
        error!("graceful shutdown timed out — exiting");
    }

    info!("agent-relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
