//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which agent runtime backs the session, and therefore which idle
/// signals are available.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Claude Code inside a tmux pane. Stop hooks plus prompt inspection.
    ClaudeTmux,
    /// Codex CLI inside a tmux pane. Prompt inspection only.
    CodexTmux,
    /// Codex app-server session. Turn-complete RPC, no pane.
    CodexApp,
}

impl Provider {
    /// The prompt glyph that marks an idle input line for pane providers.
    #[must_use]
    pub fn prompt_glyph(self) -> Option<&'static str> {
        match self {
            Self::ClaudeTmux => Some(">"),
            Self::CodexTmux => Some("›"),
            Self::CodexApp => None,
        }
    }

    /// Whether the provider runs inside a tmux pane.
    #[must_use]
    pub fn has_pane(self) -> bool {
        !matches!(self, Self::CodexApp)
    }

    /// Pane name prefix used when deriving `tmux_name`.
    fn pane_prefix(self) -> &'static str {
        match self {
            Self::ClaudeTmux => "claude",
            Self::CodexTmux | Self::CodexApp => "codex",
        }
    }
}

/// Lifecycle status for an agent session.
///
/// `Stopped` is terminal; no transition leaves it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Agent is mid-turn.
    Running,
    /// Agent is at its input prompt.
    Idle,
    /// Pane killed or provider torn down.
    Stopped,
}

/// An agent session owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Short unique identifier (8 hex chars).
    pub id: String,
    /// Backing agent runtime.
    pub provider: Provider,
    /// External tmux pane name; `None` for app-server sessions.
    pub tmux_name: Option<String>,
    /// Parent session for wake-up digests, if dispatched.
    pub parent_id: Option<String>,
    /// Working directory the agent was launched in.
    pub working_dir: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Operator-assigned name, resolvable by the registry.
    pub friendly_name: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Last observed activity of any kind.
    pub last_activity: DateTime<Utc>,
    /// Timestamp of the most recent tool call.
    pub last_tool_call: Option<DateTime<Utc>>,
    /// Name of the most recent tool called.
    pub last_tool_name: Option<String>,
    /// Whether this session is the operator/EM session.
    pub is_em: bool,
    /// Token usage as last reported by a context_usage hook.
    pub tokens_used: Option<u64>,
    /// Whether context-monitor notifications are produced for this session.
    #[serde(default = "default_true")]
    pub context_monitor_enabled: bool,
    /// Remote-chat forum thread paired with this session.
    pub chat_thread_id: Option<i64>,
    /// Pane pipe-log path.
    pub log_file: String,
    /// Transcript path as last reported by a hook.
    pub transcript_path: Option<String>,
    /// Text of the agent's last explicit status update.
    pub agent_status_text: Option<String>,
    /// When the agent last updated its status.
    pub agent_status_at: Option<DateTime<Utc>>,
    /// Agent is mid-compaction; reminders hold off.
    #[serde(skip)]
    pub is_compacting: bool,
    /// A context-usage warning has already been sent this context window.
    #[serde(skip)]
    pub context_warning_sent: bool,
    /// A context-usage critical notice has already been sent.
    #[serde(skip)]
    pub context_critical_sent: bool,
}

fn default_true() -> bool {
    true
}

impl Session {
    /// Construct a new session with a generated id and derived pane name.
    #[must_use]
    pub fn new(provider: Provider, working_dir: String) -> Self {
        let id = Uuid::new_v4().simple().to_string()[..8].to_owned();
        let tmux_name = provider
            .has_pane()
            .then(|| format!("{}-{id}", provider.pane_prefix()));
        let now = Utc::now();
        Self {
            id,
            provider,
            tmux_name,
            parent_id: None,
            working_dir,
            created_at: now,
            friendly_name: None,
            status: SessionStatus::Running,
            last_activity: now,
            last_tool_call: None,
            last_tool_name: None,
            is_em: false,
            tokens_used: None,
            context_monitor_enabled: true,
            chat_thread_id: None,
            log_file: String::new(),
            transcript_path: None,
            agent_status_text: None,
            agent_status_at: None,
            is_compacting: false,
            context_warning_sent: false,
            context_critical_sent: false,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Stopped` is terminal; `Running` and `Idle` flip freely.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self.status {
            SessionStatus::Stopped => false,
            SessionStatus::Running | SessionStatus::Idle => {
                next != self.status || next == SessionStatus::Stopped
            }
        }
    }

    /// Display name: friendly name when set, otherwise the id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.id)
    }

    /// Pane reference handed to the terminal driver. App-server
    /// sessions have no pane; their adapter keys off the session id.
    #[must_use]
    pub fn pane_ref(&self) -> &str {
        self.tmux_name.as_deref().unwrap_or(&self.id)
    }
}
