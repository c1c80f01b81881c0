//! Running the project's test suite against the learner's edits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use tracing::{error, info};

use crate::buffer::EditBuffer;
use crate::config::CommandLine;
use crate::sandbox::{write_with_parent, SandboxError, SandboxHandle};
use crate::session::{SessionSignals, SessionStatus};
use crate::terminal::{failure, note, success, Terminal};

/// Runs the test command and publishes status and output.
pub struct TestRunner {
    sandbox: SandboxHandle,
    terminal: Arc<dyn Terminal>,
    signals: Arc<SessionSignals>,
    command: CommandLine,
    timeout: Option<Duration>,
}

impl TestRunner {
    /// Creates a runner. `timeout` bounds each run; `None` waits forever.
    pub fn new(
        sandbox: SandboxHandle,
        terminal: Arc<dyn Terminal>,
        signals: Arc<SessionSignals>,
        command: CommandLine,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            sandbox,
            terminal,
            signals,
            command,
            timeout,
        }
    }

    /// Writes every buffered file to the sandbox, then runs the tests.
    ///
    /// Never fails: a harness problem (write or spawn error, timeout) ends
    /// the run as [`SessionStatus::Failed`] like a failing test would.
    pub async fn run(&self, buffer: &EditBuffer) -> SessionStatus {
        self.signals.set_status(SessionStatus::Running);
        self.signals.clear_test_output();
        self.terminal.clear();
        self.terminal.writeln(&note(&format!("Running {}...", self.command)));

        let started = Instant::now();
        let status = match self.execute(buffer).await {
            Ok(0) => {
                let elapsed = started.elapsed().as_secs_f64();
                info!("Tests passed in {:.2}s", elapsed);
                self.terminal
                    .writeln(&success(&format!("Tests passed ({elapsed:.2}s)")));
                SessionStatus::Passed
            }
            Ok(code) => {
                let elapsed = started.elapsed().as_secs_f64();
                info!("Tests failed with exit code {} in {:.2}s", code, elapsed);
                self.terminal.writeln(&failure(&format!(
                    "Tests failed with exit code {code} ({elapsed:.2}s)"
                )));
                SessionStatus::Failed
            }
            Err(e) => {
                error!("Test run could not execute: {}", e);
                self.terminal
                    .writeln(&failure("Tests could not run. Check the terminal output and try again."));
                SessionStatus::Failed
            }
        };

        self.signals.set_status(status);
        status
    }

    async fn execute(&self, buffer: &EditBuffer) -> Result<i32, SandboxError> {
        try_join_all(
            buffer
                .iter()
                .map(|(path, contents)| write_with_parent(&*self.sandbox, path, contents)),
        )
        .await?;

        let process = self
            .sandbox
            .spawn(&self.command.program, &self.command.args)
            .await?;

        let terminal = Arc::clone(&self.terminal);
        let signals = Arc::clone(&self.signals);
        process
            .pipe_until(self.timeout, move |chunk| {
                terminal.write(chunk);
                signals.append_test_output(chunk);
            })
            .await
    }
}
