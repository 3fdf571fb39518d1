#![forbid(unsafe_code)]

//! `agent-relay-ctl` — local CLI companion for `agent-relay`.
//!
//! Talks to the loopback control plane over HTTP. Prints JSON on
//! stdout for programmatic callers and `<verb> failed: <reason>` on
//! stderr for humans. Exit codes: 0 success, 1 user error, 2 backend
//! unavailable.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-ctl",
    about = "Local CLI for the agent-relay daemon",
    version,
    long_about = None
)]
struct Cli {
    /// Control-plane base URL.
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions.
    List,

    /// Create a new session.
    Create {
        /// Provider: claude_tmux, codex_tmux, or codex_app.
        #[arg(long, default_value = "claude_tmux")]
        provider: String,
        /// Working directory for the agent.
        #[arg(long, default_value = ".")]
        working_dir: String,
        /// Friendly name for later resolution.
        #[arg(long)]
        name: Option<String>,
        /// Parent session identifier.
        #[arg(long)]
        parent: Option<String>,
        /// Mark this session as the operator/EM session.
        #[arg(long)]
        em: bool,
    },

    /// Send a message to a session.
    Send {
        /// Target session id, prefix, or friendly name.
        target: String,
        /// Message text.
        text: String,
        /// Delivery mode: sequential, important, or urgent.
        #[arg(long, default_value = "sequential")]
        mode: String,
        /// Soft reminder threshold in seconds.
        #[arg(long)]
        remind_soft: Option<u64>,
        /// Hard reminder threshold in seconds.
        #[arg(long)]
        remind_hard: Option<u64>,
        /// Sending session id, for stop notifications.
        #[arg(long)]
        from: Option<String>,
        /// Parent session registered for wake-up digests on delivery.
        #[arg(long)]
        parent: Option<String>,
        /// Notify the sender when the target stops.
        #[arg(long)]
        notify_on_stop: bool,
    },

    /// Kill a session.
    Kill {
        /// Target session id, prefix, or friendly name.
        target: String,
    },

    /// Run the handoff protocol against a session.
    Handoff {
        /// Target session id, prefix, or friendly name.
        target: String,
        /// Continuation prompt path for the wake message.
        continuation_path: String,
    },

    /// Show the last lines of a session's pane.
    Output {
        /// Target session id, prefix, or friendly name.
        target: String,
        /// Number of lines.
        #[arg(long, default_value_t = 40)]
        lines: usize,
    },

    /// Record an agent status update (resets the reminder clock).
    Status {
        /// Target session id, prefix, or friendly name.
        target: String,
        /// Status text.
        text: String,
    },

    /// Watch a session and notify an observer when it goes idle.
    Watch {
        /// Session to watch.
        target: String,
        /// Session to notify.
        observer: String,
        /// Timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let client = reqwest::Client::new();
    let base = args.server.trim_end_matches('/').to_owned();

    let (verb, result) = match args.command {
        Command::List => ("list", get(&client, &format!("{base}/sessions")).await),
        Command::Create {
            provider,
            working_dir,
            name,
            parent,
            em,
        } => (
            "create",
            post(
                &client,
                &format!("{base}/sessions"),
                &json!({
                    "provider": provider,
                    "working_dir": working_dir,
                    "friendly_name": name,
                    "parent_id": parent,
                    "is_em": em,
                }),
            )
            .await,
        ),
        Command::Send {
            target,
            text,
            mode,
            remind_soft,
            remind_hard,
            from,
            parent,
            notify_on_stop,
        } => (
            "send",
            post(
                &client,
                &format!("{base}/sessions/{target}/input"),
                &json!({
                    "text": text,
                    "mode": mode,
                    "remind_soft_s": remind_soft,
                    "remind_hard_s": remind_hard,
                    "sender_id": from,
                    "parent_id": parent,
                    "notify_on_stop": notify_on_stop,
                }),
            )
            .await,
        ),
        Command::Kill { target } => (
            "kill",
            delete(&client, &format!("{base}/sessions/{target}")).await,
        ),
        Command::Handoff {
            target,
            continuation_path,
        } => (
            "handoff",
            post(
                &client,
                &format!("{base}/sessions/{target}/handoff"),
                &json!({ "continuation_path": continuation_path }),
            )
            .await,
        ),
        Command::Output { target, lines } => (
            "output",
            get(&client, &format!("{base}/sessions/{target}/output?lines={lines}")).await,
        ),
        Command::Status { target, text } => (
            "status",
            post(
                &client,
                &format!("{base}/sessions/{target}/status"),
                &json!({ "text": text }),
            )
            .await,
        ),
        Command::Watch {
            target,
            observer,
            timeout,
        } => (
            "watch",
            post(
                &client,
                &format!("{base}/watch"),
                &json!({ "target": target, "observer": observer, "timeout_s": timeout }),
            )
            .await,
        ),
    };

    match result {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(CtlError::User(reason)) => {
            eprintln!("{verb} failed: {reason}");
            ExitCode::from(1)
        }
        Err(CtlError::Backend(reason)) => {
            eprintln!("{verb} failed: {reason}");
            ExitCode::from(2)
        }
    }
}

enum CtlError {
    /// Validation or lookup error; the operator's input was wrong.
    User(String),
    /// The daemon is unreachable or failed internally.
    Backend(String),
}

async fn get(client: &reqwest::Client, url: &str) -> Result<String, CtlError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| CtlError::Backend(format!("server unavailable: {err}")))?;
    read_response(response).await
}

async fn post(client: &reqwest::Client, url: &str, body: &Value) -> Result<String, CtlError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|err| CtlError::Backend(format!("server unavailable: {err}")))?;
    read_response(response).await
}

async fn delete(client: &reqwest::Client, url: &str) -> Result<String, CtlError> {
    let response = client
        .delete(url)
        .send()
        .await
        .map_err(|err| CtlError::Backend(format!("server unavailable: {err}")))?;
    read_response(response).await
}

async fn read_response(response: reqwest::Response) -> Result<String, CtlError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| CtlError::Backend(format!("failed to read response: {err}")))?;

    if status.is_success() {
        return Ok(body);
    }

    let reason = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
        .unwrap_or_else(|| format!("HTTP {status}"));

    if status.is_client_error() {
        Err(CtlError::User(reason))
    } else {
        Err(CtlError::Backend(reason))
    }
}
