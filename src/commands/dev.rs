//! Provision a project and keep its dev server running until Ctrl-C.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use sandsync::config::Config;
use sandsync::terminal::StdoutTerminal;

use super::{load_project, open_workspace};

/// Runs the dev command.
pub(crate) async fn run(config_path: &Path, project_path: &Path) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.dev.auto_start = false;
    let project = load_project(project_path, &config)?;

    let workspace = open_workspace(&config, Arc::new(StdoutTerminal)).await?;
    let previewable = workspace.load(&project).await;
    if let Some(e) = workspace.provisioner().last_error() {
        workspace.close().await?;
        bail!("Setup of '{}' failed: {e}", project.id);
    }
    if !previewable {
        info!("'{}' has no dev server config, starting anyway", project.id);
    }

    if let Err(e) = workspace.dev().start().await {
        workspace.close().await?;
        return Err(e).context("Failed to start dev server");
    }

    let mut preview = workspace.signals().subscribe_preview();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                println!("\n{}", "Stopping dev server...".yellow());
                break;
            }
            changed = preview.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(url) = preview.borrow_and_update().clone() {
                    println!("\n{} Preview at {}\n", "➜".green().bold(), url.cyan());
                }
            }
        }
    }

    workspace.close().await
}
