//! Observable session state: test status, captured test output, preview
//! address and preview reload generation.
//!
//! Values are published through `watch` channels so a UI can await changes;
//! the test output is a plain snapshot since only the latest run matters.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// What the sandbox is doing for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No run since the project was provisioned.
    #[default]
    Idle,
    /// A run is in progress.
    Running,
    /// The last run exited with code 0.
    Passed,
    /// The last run exited non-zero or could not execute.
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The values this crate publishes to its host.
#[derive(Debug)]
pub struct SessionSignals {
    status: watch::Sender<SessionStatus>,
    preview: watch::Sender<Option<String>>,
    reload: watch::Sender<u64>,
    output: Mutex<String>,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignals {
    /// Creates signals in their initial state.
    pub fn new() -> Self {
        Self {
            status: watch::channel(SessionStatus::Idle).0,
            preview: watch::channel(None).0,
            reload: watch::channel(0).0,
            output: Mutex::new(String::new()),
        }
    }

    /// Current test status.
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watches test status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Current preview address.
    pub fn preview_url(&self) -> Option<String> {
        self.preview.borrow().clone()
    }

    /// Watches preview address changes.
    pub fn subscribe_preview(&self) -> watch::Receiver<Option<String>> {
        self.preview.subscribe()
    }

    pub(crate) fn set_preview_url(&self, url: Option<String>) {
        self.preview.send_replace(url);
    }

    /// Generation counter a preview surface reloads on.
    pub fn reload_generation(&self) -> u64 {
        *self.reload.borrow()
    }

    /// Watches reload requests.
    pub fn subscribe_reload(&self) -> watch::Receiver<u64> {
        self.reload.subscribe()
    }

    pub(crate) fn bump_reload(&self) -> u64 {
        self.reload.send_modify(|generation| *generation += 1);
        *self.reload.borrow()
    }

    /// Output captured from the most recent test run.
    pub fn test_output(&self) -> String {
        self.output_guard().clone()
    }

    pub(crate) fn clear_test_output(&self) {
        self.output_guard().clear();
    }

    pub(crate) fn append_test_output(&self, chunk: &str) {
        self.output_guard().push_str(chunk);
    }

    /// Back to a clean slate for a newly provisioned project.
    pub(crate) fn reset_for_new_project(&self) {
        self.set_status(SessionStatus::Idle);
        self.set_preview_url(None);
        self.clear_test_output();
    }

    fn output_guard(&self) -> std::sync::MutexGuard<'_, String> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
