//! Write a default `sandsync.toml`.
//!
//! This module separates pure logic from IO by accepting closures for
//! filesystem operations, making the core logic easily testable.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use sandsync::config::CONFIG_FILE;

use crate::templates;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command in the current directory.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing sandsync in {}", cwd.display());

    let files = init_files();

    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results));

    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// File to be written during init.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    /// Relative path for the file.
    path: PathBuf,
    /// File content.
    content: &'static str,
}

/// Result of attempting to write a file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteResult {
    /// File was created.
    Created,
    /// File was overwritten.
    Overwritten,
    /// File was skipped (already exists).
    Skipped,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

fn init_files() -> Vec<InitFile> {
    vec![InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::SANDSYNC_TOML,
    }]
}

/// Core init logic: decides which files to write and writes them.
///
/// Takes closures for IO operations to enable testing:
/// - `exists`: checks if a path exists
/// - `write_file`: writes content to a path
fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::new();

    for file in files {
        let existed = exists(&file.path);
        let result = if existed && !force {
            WriteResult::Skipped
        } else {
            write_file(&file.path, file.content)?;
            if existed {
                WriteResult::Overwritten
            } else {
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }

    Ok(results)
}

/// Formats init results for display with colored output.
fn format_results(results: &[(PathBuf, WriteResult)]) -> String {
    let mut out = String::new();

    for (path, result) in results {
        let path = path.display().to_string();
        let _ = match result {
            WriteResult::Created => writeln!(out, "{} Created {}", "✓".green().bold(), path.cyan()),
            WriteResult::Overwritten => {
                writeln!(out, "{} {} (overwritten)", "↻".blue(), path.cyan())
            }
            WriteResult::Skipped => writeln!(
                out,
                "{} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path
            ),
        };
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Edit {} to pick a backend and commands",
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(
        out,
        "  2. Run {} to run a project's tests",
        "sandsync test <project>".green()
    );

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
