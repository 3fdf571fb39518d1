//! tmux implementation of the terminal driver.
//!
//! Shells out to the `tmux` binary via `tokio::process`. Every call is a
//! separate subprocess; a non-zero exit is surfaced as a transient
//! driver error for the caller to retry or defer.

use tokio::process::Command;

use crate::{AppError, Result};

use super::{DriverFuture, TerminalDriver};

/// Production driver targeting a local tmux server.
#[derive(Debug, Clone, Default)]
pub struct TmuxDriver;

impl TmuxDriver {
    /// Create a driver instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn run_tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|err| AppError::Driver(format!("failed to exec tmux: {err}")))?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::Driver(format!(
            "tmux {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )))
    }
}

impl TerminalDriver for TmuxDriver {
    fn send_literal_text<'a>(&'a self, pane: &'a str, text: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            run_tmux(&["send-keys", "-t", pane, "-l", text]).await?;
            Ok(())
        })
    }

    fn send_submit_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            run_tmux(&["send-keys", "-t", pane, "Enter"]).await?;
            Ok(())
        })
    }

    fn send_cancel_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            run_tmux(&["send-keys", "-t", pane, "Escape"]).await?;
            Ok(())
        })
    }

    fn capture_pane<'a>(&'a self, pane: &'a str, from_start: bool) -> DriverFuture<'a, String> {
        Box::pin(async move {
            if from_start {
                run_tmux(&["capture-pane", "-p", "-S", "-", "-t", pane]).await
            } else {
                run_tmux(&["capture-pane", "-p", "-t", pane]).await
            }
        })
    }

    fn create_pane<'a>(
        &'a self,
        pane: &'a str,
        working_dir: &'a str,
        command: &'a str,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            run_tmux(&["new-session", "-d", "-s", pane, "-c", working_dir, command]).await?;
            Ok(())
        })
    }

    fn kill_pane<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            run_tmux(&["kill-session", "-t", pane]).await?;
            Ok(())
        })
    }

    fn exists<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, bool> {
        Box::pin(async move {
            let output = Command::new("tmux")
                .args(["has-session", "-t", pane])
                .output()
                .await
                .map_err(|err| AppError::Driver(format!("failed to exec tmux: {err}")))?;
            Ok(output.status.success())
        })
    }

    fn pipe_pane<'a>(&'a self, pane: &'a str, log_file: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let sink = format!("cat >> {log_file}");
            run_tmux(&["pipe-pane", "-t", pane, "-o", &sink]).await?;
            Ok(())
        })
    }
}
