//! CLI command implementations.
//!
//! Each submodule implements one sandsync command. Shared setup (config,
//! project and workspace loading) lives here.

pub mod dev;
pub mod init;
pub mod session;
pub mod setup;

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use sandsync::config::Config;
use sandsync::project::Project;
use sandsync::sandbox::{boot_from_config, EnvironmentAcquirer};
use sandsync::terminal::Terminal;
use sandsync::workspace::Workspace;

/// Loads a project, skipping the configured dependency directory.
pub(crate) fn load_project(path: &Path, config: &Config) -> Result<Project> {
    Project::load(path, &[config.install.deps_dir.as_str()])
        .with_context(|| format!("Failed to load project: {}", path.display()))
}

/// Boots the configured sandbox and opens a workspace on it.
pub(crate) async fn open_workspace(
    config: &Config,
    terminal: Arc<dyn Terminal>,
) -> Result<Workspace> {
    let acquirer = EnvironmentAcquirer::new(boot_from_config(config.sandbox.clone()));
    Workspace::open(config, terminal, &acquirer).await
}
