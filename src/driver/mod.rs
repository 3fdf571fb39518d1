//! Terminal-driver abstraction.
//!
//! The [`TerminalDriver`] trait decouples the orchestration core from
//! the terminal multiplexer. The delivery engine, handoff coordinator,
//! and idle tracker all speak to panes exclusively through this trait,
//! which keeps them testable against a recording mock.
//!
//! Literal text and the submit key are separate operations on purpose:
//! the engine owes the agent a settle interval between them, and a
//! combined "text + carriage return" send is consumed as pasted input.

pub mod tmux;

use std::future::Future;
use std::pin::Pin;

use crate::Result;

/// Boxed future alias for dyn-compatible async trait methods.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Interface between the orchestration core and a terminal pane.
pub trait TerminalDriver: Send + Sync {
    /// Send literal text into a pane without submitting it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the send fails.
    fn send_literal_text<'a>(&'a self, pane: &'a str, text: &'a str) -> DriverFuture<'a, ()>;

    /// Send the submit key (Enter) to a pane.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the send fails.
    fn send_submit_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()>;

    /// Send the cancel key (Escape) to a pane.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the send fails.
    fn send_cancel_key<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()>;

    /// Capture pane contents. `from_start` requests the full scrollback,
    /// bounded by the pane's history limit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the capture fails.
    fn capture_pane<'a>(&'a self, pane: &'a str, from_start: bool) -> DriverFuture<'a, String>;

    /// Create a detached pane running `command` in `working_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if creation fails.
    fn create_pane<'a>(
        &'a self,
        pane: &'a str,
        working_dir: &'a str,
        command: &'a str,
    ) -> DriverFuture<'a, ()>;

    /// Kill a pane.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the kill fails.
    fn kill_pane<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, ()>;

    /// Whether the pane currently exists.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the check fails.
    fn exists<'a>(&'a self, pane: &'a str) -> DriverFuture<'a, bool>;

    /// Mirror pane output into a log file.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) if the pipe setup fails.
    fn pipe_pane<'a>(&'a self, pane: &'a str, log_file: &'a str) -> DriverFuture<'a, ()>;
}
