//! One learner session: a sandbox, the edit buffer and every component
//! that keeps them in step.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::buffer::{normalize_path, EditBuffer};
use crate::config::Config;
use crate::devserver::DevServer;
use crate::editor::{Editor, EditorModelSync};
use crate::fileops::FileOperations;
use crate::filesync::{FileSyncEngine, FileSyncHandle};
use crate::project::Project;
use crate::provision::{ChallengeProvisioner, ProvisionSettings};
use crate::sandbox::{EnvironmentAcquirer, SandboxHandle};
use crate::session::{SessionSignals, SessionStatus};
use crate::terminal::{failure, Terminal};
use crate::testrun::TestRunner;

/// Wires the session components around one live sandbox.
pub struct Workspace {
    sandbox: SandboxHandle,
    terminal: Arc<dyn Terminal>,
    signals: Arc<SessionSignals>,
    buffer: Arc<watch::Sender<EditBuffer>>,
    ready: watch::Sender<bool>,
    auto_start: bool,
    provisioner: ChallengeProvisioner,
    dev: DevServer,
    tests: TestRunner,
    files: FileOperations,
    sync: Option<FileSyncHandle>,
}

impl Workspace {
    /// Acquires the session's sandbox and builds every component around it.
    pub async fn open(
        config: &Config,
        terminal: Arc<dyn Terminal>,
        acquirer: &EnvironmentAcquirer,
    ) -> Result<Self> {
        let commands = config.commands()?;
        let sandbox = acquirer
            .acquire()
            .await
            .context("Failed to start the sandbox")?;
        info!("Workspace open on {} sandbox", sandbox.name());

        let signals = Arc::new(SessionSignals::new());
        let buffer = Arc::new(watch::channel(EditBuffer::new()).0);
        let (ready, ready_rx) = watch::channel(false);

        let sync = FileSyncEngine::spawn(
            Arc::clone(&sandbox),
            buffer.subscribe(),
            ready_rx,
            config.sync.debounce(),
        );

        Ok(Self {
            provisioner: ChallengeProvisioner::new(
                Arc::clone(&sandbox),
                Arc::clone(&terminal),
                Arc::clone(&signals),
                ProvisionSettings::from_config(config, commands.install),
            ),
            dev: DevServer::new(
                Arc::clone(&sandbox),
                Arc::clone(&terminal),
                Arc::clone(&signals),
                commands.dev,
            ),
            tests: TestRunner::new(
                Arc::clone(&sandbox),
                Arc::clone(&terminal),
                Arc::clone(&signals),
                commands.test,
                config.test.timeout_secs.map(Duration::from_secs),
            ),
            files: FileOperations::new(Arc::clone(&sandbox), Arc::clone(&buffer)),
            sandbox,
            terminal,
            signals,
            buffer,
            ready,
            auto_start: config.dev.auto_start,
            sync: Some(sync),
        })
    }

    /// Provisions `project` and, if it is previewable, starts the dev server.
    ///
    /// Loading a new project replaces the edit buffer with the project's
    /// visible files. Loading the current project again keeps the edits.
    /// Returns whether the project wants a preview server.
    pub async fn load(&self, project: &Project) -> bool {
        let fresh = self.provisioner.current_project().as_deref() != Some(project.id.as_str());
        if fresh {
            debug!("Loading new project '{}'", project.id);
            self.ready.send_replace(false);
            self.dev.stop();
            self.buffer.send_replace(project.initial_buffer());
        }

        let outcome = self.provisioner.try_setup(project).await;
        let previewable = *outcome.as_ref().unwrap_or(&false);

        if fresh {
            // A later load may have taken over while this one was awaiting.
            if self.provisioner.current_project().as_deref() != Some(project.id.as_str()) {
                debug!("'{}' was replaced while provisioning", project.id);
                return previewable;
            }
            let provisioned = outcome.is_ok();
            self.ready.send_replace(provisioned);
            if provisioned && previewable && self.auto_start {
                self.start_preview().await;
            }
        }
        previewable
    }

    /// Starts the dev server, reporting a failure to the terminal.
    pub async fn start_preview(&self) {
        if let Err(e) = self.dev.start().await {
            error!("Failed to start dev server: {}", e);
            self.terminal
                .writeln(&failure(&format!("Could not start the dev server: {e}")));
        }
    }

    /// Replaces the contents of one file in the edit buffer.
    pub fn edit(&self, path: &str, content: &str) -> Result<()> {
        let Some(path) = normalize_path(path) else {
            bail!("Invalid path: {path}");
        };
        self.buffer.send_modify(|buffer| {
            buffer.insert(path, content);
        });
        Ok(())
    }

    /// Runs the tests against the current edit buffer.
    pub async fn run_tests(&self) -> SessionStatus {
        let snapshot = self.buffer.borrow().clone();
        self.tests.run(&snapshot).await
    }

    /// Keeps `editor`'s models in step with the edit buffer until the
    /// workspace is closed.
    pub fn attach_editor(&self, editor: Arc<dyn Editor>) -> JoinHandle<()> {
        EditorModelSync::new(editor).spawn(self.subscribe_buffer())
    }

    /// Current edit buffer.
    pub fn buffer(&self) -> EditBuffer {
        self.buffer.borrow().clone()
    }

    /// Watches the edit buffer.
    pub fn subscribe_buffer(&self) -> watch::Receiver<EditBuffer> {
        self.buffer.subscribe()
    }

    /// Published session values.
    pub fn signals(&self) -> &Arc<SessionSignals> {
        &self.signals
    }

    /// Create, delete and rename.
    pub fn files(&self) -> &FileOperations {
        &self.files
    }

    /// The preview dev server.
    pub fn dev(&self) -> &DevServer {
        &self.dev
    }

    /// The session's provisioner.
    pub fn provisioner(&self) -> &ChallengeProvisioner {
        &self.provisioner
    }

    /// The live sandbox.
    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    /// Stops background work and releases the sandbox.
    pub async fn close(mut self) -> Result<()> {
        self.dev.stop();
        if let Some(sync) = self.sync.take() {
            sync.stop();
        }
        self.sandbox
            .dispose()
            .await
            .context("Failed to release the sandbox")
    }
}
