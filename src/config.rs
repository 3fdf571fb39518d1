//! Global configuration parsing, validation, and path derivation.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Delivery-engine tuning knobs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryConfig {
    /// Settle interval between literal-text injection and the submit key.
    ///
    /// Collapsing the two into one atomic send trips the agent's
    /// paste-detection heuristic, which eats the carriage return.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// How long the urgent path polls for the input prompt after cancel.
    #[serde(default = "default_urgent_prompt_timeout_s")]
    pub urgent_prompt_timeout_s: u64,
    /// Interval between prompt polls on the urgent path.
    #[serde(default = "default_urgent_poll_ms")]
    pub urgent_poll_ms: u64,
    /// TTL for the stop-hook skip fence armed before a `/clear`.
    ///
    /// Hook transport timeout plus a small margin.
    #[serde(default = "default_skip_fence_ttl_s")]
    pub skip_fence_ttl_s: u64,
}

fn default_settle_ms() -> u64 {
    300
}

fn default_urgent_prompt_timeout_s() -> u64 {
    3
}

fn default_urgent_poll_ms() -> u64 {
    200
}

fn default_skip_fence_ttl_s() -> u64 {
    8
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            urgent_prompt_timeout_s: default_urgent_prompt_timeout_s(),
            urgent_poll_ms: default_urgent_poll_ms(),
            skip_fence_ttl_s: default_skip_fence_ttl_s(),
        }
    }
}

/// Reminder and parent-wake thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemindConfig {
    /// Default soft reminder threshold for dispatched children.
    #[serde(default = "default_remind_soft_s")]
    pub soft_threshold_s: u64,
    /// Default hard (urgent) reminder threshold.
    #[serde(default = "default_remind_hard_s")]
    pub hard_threshold_s: u64,
    /// Reminder poll tick.
    #[serde(default = "default_remind_poll_s")]
    pub poll_interval_s: u64,
    /// Parent wake-up digest period.
    #[serde(default = "default_wake_period_s")]
    pub wake_period_s: u64,
    /// Escalated wake period when the child shows no progress.
    #[serde(default = "default_wake_escalated_s")]
    pub wake_escalated_period_s: u64,
    /// Ceiling on how long a one-shot reminder waits out a compaction.
    #[serde(default = "default_compaction_wait_s")]
    pub compaction_wait_ceiling_s: u64,
}

fn default_remind_soft_s() -> u64 {
    210
}

fn default_remind_hard_s() -> u64 {
    420
}

fn default_remind_poll_s() -> u64 {
    5
}

fn default_wake_period_s() -> u64 {
    600
}

fn default_wake_escalated_s() -> u64 {
    300
}

fn default_compaction_wait_s() -> u64 {
    300
}

impl Default for RemindConfig {
    fn default() -> Self {
        Self {
            soft_threshold_s: default_remind_soft_s(),
            hard_threshold_s: default_remind_hard_s(),
            poll_interval_s: default_remind_poll_s(),
            wake_period_s: default_wake_period_s(),
            wake_escalated_period_s: default_wake_escalated_s(),
            compaction_wait_ceiling_s: default_compaction_wait_s(),
        }
    }
}

/// Telegram gateway settings.
///
/// The bot token is loaded at runtime from the `TELEGRAM_BOT_TOKEN`
/// environment variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TelegramConfig {
    /// Whether the gateway is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Chat where session topics are created.
    #[serde(default)]
    pub chat_id: i64,
    /// Long-poll timeout sent to the Bot API.
    #[serde(default = "default_poll_timeout_s")]
    pub poll_timeout_s: u64,
    /// Total request bound for one poll round-trip.
    ///
    /// Must exceed `poll_timeout_s`; guards against silent TCP stalls
    /// where per-chunk timeouts never fire.
    #[serde(default = "default_poll_total_timeout_s")]
    pub poll_total_timeout_s: u64,
    /// Health monitor restarts the poller when no round-trip was
    /// observed for this long.
    #[serde(default = "default_health_stall_s")]
    pub health_stall_s: u64,
    /// Bot token, populated at runtime.
    #[serde(skip)]
    pub bot_token: String,
}

fn default_poll_timeout_s() -> u64 {
    10
}

fn default_poll_total_timeout_s() -> u64 {
    15
}

fn default_health_stall_s() -> u64 {
    45
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chat_id: 0,
            poll_timeout_s: default_poll_timeout_s(),
            poll_total_timeout_s: default_poll_total_timeout_s(),
            health_stall_s: default_health_stall_s(),
            bot_token: String::new(),
        }
    }
}

/// Watcher polling cadence.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WatchConfig {
    /// Interval between idle checks.
    #[serde(default = "default_watch_poll_s")]
    pub poll_interval_s: u64,
}

fn default_watch_poll_s() -> u64 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_watch_poll_s(),
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory for the registry snapshot, queue database, and handoff
    /// artifacts. Defaults to `~/.local/share/agent-relay`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Loopback port for the HTTP control plane.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Command used to launch a Claude Code pane.
    #[serde(default = "default_claude_command")]
    pub claude_command: String,
    /// Command used to launch a Codex CLI pane.
    #[serde(default = "default_codex_command")]
    pub codex_command: String,
    /// Directory for per-pane pipe logs.
    #[serde(default = "default_pipe_log_dir")]
    pub pipe_log_dir: PathBuf,
    /// Days after delivery before queue rows are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Delivery-engine tuning.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Reminder thresholds.
    #[serde(default)]
    pub remind: RemindConfig,
    /// Telegram gateway settings.
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Watcher cadence.
    #[serde(default)]
    pub watch: WatchConfig,
}

fn default_http_port() -> u16 {
    8787
}

fn default_claude_command() -> String {
    "claude".into()
}

fn default_codex_command() -> String {
    "codex".into()
}

fn default_pipe_log_dir() -> PathBuf {
    PathBuf::from("/tmp/agent-relay-sessions")
}

fn default_retention_days() -> u32 {
    30
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            http_port: default_http_port(),
            claude_command: default_claude_command(),
            codex_command: default_codex_command(),
            pipe_log_dir: default_pipe_log_dir(),
            retention_days: default_retention_days(),
            delivery: DeliveryConfig::default(),
            remind: RemindConfig::default(),
            telegram: TelegramConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the Telegram bot token from the environment when the
    /// gateway is enabled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when enabled but no token is present.
    pub fn load_credentials(&mut self) -> Result<()> {
        if !self.telegram.enabled {
            return Ok(());
        }
        self.telegram.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").map_err(|_| {
            AppError::Config("telegram enabled but TELEGRAM_BOT_TOKEN is not set".into())
        })?;
        Ok(())
    }

    /// Resolved data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agent-relay")
        })
    }

    /// Path of the registry JSON snapshot.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.data_dir().join("sessions.json")
    }

    /// Path of the message-queue database.
    #[must_use]
    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir().join("queue.db")
    }

    /// Path of the tool-usage observability database.
    #[must_use]
    pub fn observability_db_path(&self) -> PathBuf {
        self.data_dir().join("tool_events.db")
    }

    /// Directory for handoff scrollback dumps.
    #[must_use]
    pub fn handoff_dir(&self) -> PathBuf {
        self.data_dir().join("handoffs")
    }

    fn validate(&self) -> Result<()> {
        if self.delivery.settle_ms < 300 {
            return Err(AppError::Config(
                "delivery.settle_ms must be at least 300".into(),
            ));
        }
        if self.remind.soft_threshold_s >= self.remind.hard_threshold_s {
            return Err(AppError::Config(
                "remind.soft_threshold_s must be below hard_threshold_s".into(),
            ));
        }
        if self.telegram.enabled && self.telegram.chat_id == 0 {
            return Err(AppError::Config(
                "telegram.chat_id is required when the gateway is enabled".into(),
            ));
        }
        if self.telegram.poll_total_timeout_s <= self.telegram.poll_timeout_s {
            return Err(AppError::Config(
                "telegram.poll_total_timeout_s must exceed poll_timeout_s".into(),
            ));
        }
        Ok(())
    }
}
