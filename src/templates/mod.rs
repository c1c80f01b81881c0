//! Embedded templates.

/// Default `sandsync.toml` configuration.
pub(crate) const SANDSYNC_TOML: &str = include_str!("sandsync.toml");
