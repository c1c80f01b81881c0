//! Heuristic dependency cache check.
//!
//! A populated dependency directory is taken as proof the install already
//! ran. This is not a lockfile comparison: an unnecessary reinstall is
//! fine, skipping a needed one is not, hence a minimum entry count rather
//! than "any entry".

use tracing::debug;

use crate::sandbox::Sandbox;

/// Returns true if the install step must run.
pub async fn needs_install(sandbox: &dyn Sandbox, deps_dir: &str, min_entries: usize) -> bool {
    match sandbox.read_dir(deps_dir).await {
        Ok(entries) if entries.len() >= min_entries => {
            debug!(
                "{} has {} entries (threshold {}), skipping install",
                deps_dir,
                entries.len(),
                min_entries
            );
            false
        }
        Ok(entries) => {
            debug!(
                "{} has only {} entries (threshold {})",
                deps_dir,
                entries.len(),
                min_entries
            );
            true
        }
        Err(e) => {
            debug!("Cannot list {}: {}", deps_dir, e);
            true
        }
    }
}
