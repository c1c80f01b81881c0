//! Challenge provisioning: get a project's files and dependencies into the
//! sandbox, once per project id.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::{CommandLine, Config};
use crate::deps::needs_install;
use crate::project::Project;
use crate::sandbox::{MountTree, SandboxError, SandboxHandle};
use crate::session::SessionSignals;
use crate::terminal::{failure, note, success, Terminal};

/// Why a provisioning attempt stopped.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    /// Writing the project files failed.
    #[error("Failed to mount project files: {0}")]
    Mount(#[source] SandboxError),

    /// The install process could not run to completion.
    #[error("Dependency install did not complete: {0}")]
    Install(#[source] SandboxError),

    /// The install process exited non-zero.
    #[error("Dependency install exited with code {code}")]
    InstallFailed {
        /// Exit code of the install command.
        code: i32,
    },
}

impl ProvisionError {
    /// Returns true if the install command itself reported failure.
    pub fn is_install_failure(&self) -> bool {
        matches!(self, Self::InstallFailed { .. } | Self::Install(_))
    }
}

/// Everything provisioning needs from the configuration.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Install command.
    pub install: CommandLine,
    /// Deadline for the install command.
    pub install_timeout: Option<Duration>,
    /// Directory the install populates.
    pub deps_dir: String,
    /// Entry threshold for treating `deps_dir` as cached.
    pub min_entries: usize,
    /// Directory removed before mounting a new project.
    pub source_dir: String,
    /// Forget failed projects so the same id can be retried.
    pub retry_failed: bool,
    /// Files that mark a project as previewable.
    pub dev_config_files: Vec<String>,
    /// Manifest whose `scripts.dev` marks a project as previewable.
    pub manifest: String,
}

impl ProvisionSettings {
    /// Builds settings from a loaded config and its parsed install command.
    pub fn from_config(config: &Config, install: CommandLine) -> Self {
        Self {
            install,
            install_timeout: config.install.timeout_secs.map(Duration::from_secs),
            deps_dir: config.install.deps_dir.clone(),
            min_entries: config.install.min_entries,
            source_dir: config.provision.source_dir.clone(),
            retry_failed: config.provision.retry_failed,
            dev_config_files: config.dev.config_files.clone(),
            manifest: config.dev.manifest.clone(),
        }
    }
}

/// The project last handed to [`ChallengeProvisioner::setup`].
struct Current {
    id: String,
    decision: Arc<OnceCell<Outcome>>,
}

/// What one provisioning run produced: the start-server decision, or why
/// it failed.
pub type Outcome = Result<bool, ProvisionError>;

/// Provisions projects into one sandbox.
pub struct ChallengeProvisioner {
    sandbox: SandboxHandle,
    terminal: Arc<dyn Terminal>,
    signals: Arc<SessionSignals>,
    settings: ProvisionSettings,
    current: Mutex<Option<Current>>,
    mounted: Mutex<BTreeSet<String>>,
    last_error: Mutex<Option<ProvisionError>>,
}

impl ChallengeProvisioner {
    /// Creates a provisioner for a live sandbox.
    pub fn new(
        sandbox: SandboxHandle,
        terminal: Arc<dyn Terminal>,
        signals: Arc<SessionSignals>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            sandbox,
            terminal,
            signals,
            settings,
            current: Mutex::new(None),
            mounted: Mutex::new(BTreeSet::new()),
            last_error: Mutex::new(None),
        }
    }

    /// Provisions `project` and returns whether a preview server should start.
    ///
    /// Calling this again with the id of the current project returns the
    /// earlier decision without touching the sandbox. A call that arrives
    /// while the first one is still running waits for it.
    pub async fn setup(&self, project: &Project) -> bool {
        self.try_setup(project).await.unwrap_or(false)
    }

    /// Like [`ChallengeProvisioner::setup`], but returns the outcome of the
    /// run this call joined instead of collapsing failures to `false`.
    pub async fn try_setup(&self, project: &Project) -> Outcome {
        // Claimed before the first await so a duplicate call joins this one.
        let decision = {
            let mut current = lock(&self.current);
            match current.as_ref() {
                Some(c) if c.id == project.id => {
                    debug!("Project '{}' already provisioned", project.id);
                    Arc::clone(&c.decision)
                }
                _ => {
                    let cell = Arc::new(OnceCell::new());
                    *current = Some(Current {
                        id: project.id.clone(),
                        decision: Arc::clone(&cell),
                    });
                    cell
                }
            }
        };

        decision
            .get_or_init(|| self.provision(project, &decision))
            .await
            .clone()
    }

    /// The id of the project most recently handed to `setup`.
    pub fn current_project(&self) -> Option<String> {
        lock(&self.current).as_ref().map(|c| c.id.clone())
    }

    /// The failure of the most recent provisioning attempt, if it failed.
    pub fn last_error(&self) -> Option<ProvisionError> {
        lock(&self.last_error).clone()
    }

    async fn provision(&self, project: &Project, decision: &Arc<OnceCell<Outcome>>) -> Outcome {
        info!("Provisioning project '{}'", project.id);
        self.signals.reset_for_new_project();
        *lock(&self.last_error) = None;

        match self.run_steps(project).await {
            Ok(()) => {
                let previewable = is_previewable(
                    project,
                    &self.settings.dev_config_files,
                    &self.settings.manifest,
                );
                info!(
                    "Project '{}' ready (preview server: {})",
                    project.id, previewable
                );
                self.terminal.writeln(&success("Project ready"));
                Ok(previewable)
            }
            Err(e) => {
                error!("Provisioning '{}' failed: {}", project.id, e);
                self.terminal.writeln(&failure(&format!("Setup failed: {e}")));
                *lock(&self.last_error) = Some(e.clone());

                if self.settings.retry_failed {
                    let mut current = lock(&self.current);
                    if current
                        .as_ref()
                        .is_some_and(|c| Arc::ptr_eq(&c.decision, decision))
                    {
                        *current = None;
                    }
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&self, project: &Project) -> Result<(), ProvisionError> {
        self.remove_previous(project).await;

        self.terminal.writeln(&note("Mounting project files..."));
        let tree = MountTree::from_files(&project.contents());
        self.sandbox
            .mount(&tree)
            .await
            .map_err(ProvisionError::Mount)?;
        *lock(&self.mounted) = project.files.keys().cloned().collect();

        if needs_install(
            &*self.sandbox,
            &self.settings.deps_dir,
            self.settings.min_entries,
        )
        .await
        {
            self.install().await?;
        } else {
            self.terminal
                .writeln(&note("Dependencies cached, skipping install"));
        }
        Ok(())
    }

    /// Clears the previous project's files. Never fails.
    async fn remove_previous(&self, project: &Project) {
        let source_dir = &self.settings.source_dir;
        let nested = format!("{source_dir}/");
        let stale: Vec<String> = lock(&self.mounted)
            .iter()
            .filter(|p| !project.has_file(p) && !p.starts_with(&nested))
            .cloned()
            .collect();

        for path in std::iter::once(source_dir).chain(stale.iter()) {
            match self.sandbox.rm(path).await {
                Ok(()) => debug!("Removed {}", path),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove {}: {}", path, e),
            }
        }
    }

    async fn install(&self) -> Result<(), ProvisionError> {
        let command = &self.settings.install;
        info!("Installing dependencies: {}", command);
        self.terminal
            .writeln(&note(&format!("Installing dependencies ({command})...")));

        let process = self
            .sandbox
            .spawn(&command.program, &command.args)
            .await
            .map_err(ProvisionError::Install)?;

        let terminal = Arc::clone(&self.terminal);
        let code = process
            .pipe_until(self.settings.install_timeout, move |chunk| terminal.write(chunk))
            .await
            .map_err(ProvisionError::Install)?;

        if code != 0 {
            return Err(ProvisionError::InstallFailed { code });
        }
        debug!("Install finished");
        Ok(())
    }
}

/// Returns true if the project looks like it runs a dev server: it ships one
/// of `config_files`, or its manifest declares a `dev` script.
pub fn is_previewable(project: &Project, config_files: &[String], manifest: &str) -> bool {
    if config_files.iter().any(|f| project.has_file(f)) {
        return true;
    }

    project
        .content(manifest)
        .and_then(|content| serde_json::from_str::<serde_json::Value>(content).ok())
        .is_some_and(|m| m.get("scripts").and_then(|s| s.get("dev")).is_some())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
