//! `sandsync.toml` configuration.
//!
//! Every field has a default, so a missing file or a partial file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "sandsync.toml";

/// Top-level configuration, loaded from `sandsync.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sandbox backend selection and limits.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Dependency install step.
    #[serde(default)]
    pub install: InstallConfig,
    /// Preview dev server.
    #[serde(default)]
    pub dev: DevConfig,
    /// Test runner.
    #[serde(default)]
    pub test: TestConfig,
    /// Edit buffer to sandbox synchronization.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Challenge provisioning.
    #[serde(default)]
    pub provision: ProvisionConfig,
}

/// Which sandbox implementation to boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A private directory on this machine.
    #[default]
    Local,
    /// A long-lived Docker container.
    Docker,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend to boot
    #[serde(default)]
    pub backend: Backend,

    /// Working directory for the local backend.
    /// - Unset: a fresh directory under the user cache dir, removed at exit
    /// - Set: used as-is and kept (`~` is expanded)
    #[serde(default)]
    pub root: Option<String>,

    /// Docker image to use
    #[serde(default = "default_image")]
    pub image: String,

    /// Container ports published to the same host port
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Resource limits
    #[serde(default)]
    pub resources: ResourceConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            root: None,
            image: default_image(),
            ports: default_ports(),
            network: NetworkConfig::default(),
            resources: ResourceConfig::default(),
        }
    }
}

/// Network access policy for sandbox containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Default bridge network
    #[default]
    AllowAll,
    /// No network at all
    Deny,
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network policy
    #[serde(default)]
    pub policy: NetworkPolicy,
}

/// Container resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit (e.g., "2g")
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (e.g., "2")
    #[serde(default = "default_cpus")]
    pub cpus: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

/// Dependency install configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install command line
    #[serde(default = "default_install_command")]
    pub command: String,

    /// Directory the install populates
    #[serde(default = "default_deps_dir")]
    pub deps_dir: String,

    /// Fewer entries than this in `deps_dir` means the install must run
    #[serde(default = "default_min_entries")]
    pub min_entries: usize,

    /// Kill the install after this many seconds (unbounded if unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            deps_dir: default_deps_dir(),
            min_entries: default_min_entries(),
            timeout_secs: None,
        }
    }
}

/// Dev server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevConfig {
    /// Dev server command line
    #[serde(default = "default_dev_command")]
    pub command: String,

    /// Start the dev server after provisioning a previewable project
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Any of these files marks a project as previewable
    #[serde(default = "default_dev_config_files")]
    pub config_files: Vec<String>,

    /// Manifest whose `scripts.dev` entry marks a project as previewable
    #[serde(default = "default_manifest")]
    pub manifest: String,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            command: default_dev_command(),
            auto_start: true,
            config_files: default_dev_config_files(),
            manifest: default_manifest(),
        }
    }
}

/// Test runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Test command line
    #[serde(default = "default_test_command")]
    pub command: String,

    /// Kill the test run after this many seconds (unbounded if unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: default_test_command(),
            timeout_secs: None,
        }
    }
}

/// File sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last edit before files are written
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl SyncConfig {
    /// Debounce window as a `Duration`.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Source directory removed before a new project is mounted
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Forget a failed project so setting up the same id runs again
    #[serde(default)]
    pub retry_failed: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            retry_failed: false,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![5173]
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> String {
    "2".to_string()
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_deps_dir() -> String {
    "node_modules".to_string()
}

fn default_min_entries() -> usize {
    5
}

fn default_dev_command() -> String {
    "npm run dev".to_string()
}

fn default_dev_config_files() -> Vec<String> {
    [
        "vite.config.js",
        "vite.config.ts",
        "vite.config.mjs",
        "next.config.js",
        "next.config.mjs",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_manifest() -> String {
    "package.json".to_string()
}

fn default_test_command() -> String {
    "npx vitest run".to_string()
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_source_dir() -> String {
    "src".to_string()
}

/// A command line split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program to run.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Parses a command with shell quoting rules, e.g. `sh -c "a && b"`.
    pub fn parse(command: &str) -> Result<Self> {
        let parts = shell_words::split(command)
            .with_context(|| format!("Failed to parse command: {command}"))?;

        let (program, args) = parts
            .split_first()
            .with_context(|| "Command cannot be empty".to_string())?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The parsed command lines a session runs.
#[derive(Debug, Clone)]
pub struct Commands {
    /// Dependency install.
    pub install: CommandLine,
    /// Dev server.
    pub dev: CommandLine,
    /// Test run.
    pub test: CommandLine,
}

impl Config {
    /// Load configuration from a file, using defaults if it does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Parses every configured command line.
    pub fn commands(&self) -> Result<Commands> {
        Ok(Commands {
            install: CommandLine::parse(&self.install.command).context("Invalid [install] command")?,
            dev: CommandLine::parse(&self.dev.command).context("Invalid [dev] command")?,
            test: CommandLine::parse(&self.test.command).context("Invalid [test] command")?,
        })
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sandbox.backend, Backend::Local);
        assert_eq!(config.install.deps_dir, "node_modules");
        assert_eq!(config.install.min_entries, 5);
        assert_eq!(config.sync.debounce(), Duration::from_millis(300));
        assert!(config.dev.auto_start);
        assert!(!config.provision.retry_failed);
        assert!(config.install.timeout_secs.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sandbox]
backend = "docker"
image = "node:22"

[sandbox.network]
policy = "deny"

[install]
command = "pnpm install"
min_entries = 10
timeout_secs = 120

[test]
command = "npx jest --ci"

[sync]
debounce_ms = 50

[provision]
retry_failed = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.backend, Backend::Docker);
        assert_eq!(config.sandbox.image, "node:22");
        assert_eq!(config.sandbox.network.policy, NetworkPolicy::Deny);
        assert_eq!(config.install.command, "pnpm install");
        assert_eq!(config.install.min_entries, 10);
        assert_eq!(config.install.timeout_secs, Some(120));
        assert_eq!(config.install.deps_dir, "node_modules");
        assert_eq!(config.test.command, "npx jest --ci");
        assert_eq!(config.sync.debounce_ms, 50);
        assert!(config.provision.retry_failed);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.dev.command, "npm run dev");
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[sync]\ndebounce_ms = \"soon\"\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_command_line_parse_quoted() {
        let cmd = CommandLine::parse(r#"sh -c "npm test && echo done""#).unwrap();
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c", "npm test && echo done"]);
    }

    #[test]
    fn test_command_line_parse_rejects_empty_and_unmatched() {
        assert!(CommandLine::parse("").is_err());
        assert!(CommandLine::parse("echo 'oops").is_err());
    }

    #[test]
    fn test_command_line_display() {
        let cmd = CommandLine::parse("npx vitest run").unwrap();
        assert_eq!(cmd.to_string(), "npx vitest run");
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/srv/box").unwrap(), PathBuf::from("/srv/box"));

        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/box").unwrap();
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with("box"));
        }
    }
}
