//! Provision a project into a fresh sandbox and report the outcome.

use anyhow::{bail, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use sandsync::config::Config;
use sandsync::terminal::StdoutTerminal;

use super::{load_project, open_workspace};

/// Runs the setup command.
pub(crate) async fn run(config_path: &Path, project_path: &Path) -> Result<()> {
    let mut config = Config::load(config_path)?;
    config.dev.auto_start = false;
    let project = load_project(project_path, &config)?;

    info!(
        "Setting up '{}' ({} files)",
        project.id,
        project.files.len()
    );

    let workspace = open_workspace(&config, Arc::new(StdoutTerminal)).await?;
    let previewable = workspace.load(&project).await;
    let failure = workspace.provisioner().last_error();
    workspace.close().await?;

    if let Some(e) = failure {
        bail!("Setup of '{}' failed: {e}", project.id);
    }

    println!("\n{}", summary(&project.id, previewable));
    Ok(())
}

fn summary(id: &str, previewable: bool) -> String {
    if previewable {
        format!(
            "{} '{}' is ready and has a dev server (run {})",
            "✓".green().bold(),
            id,
            format!("sandsync dev {id}").cyan()
        )
    } else {
        format!("{} '{}' is ready (no dev server)", "✓".green().bold(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        colored::control::set_override(false);
        assert!(summary("counter", true).contains("has a dev server"));
        assert_eq!(summary("counter", false), "✓ 'counter' is ready (no dev server)");
    }
}
