use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandsync::config::CONFIG_FILE;
use sandsync::session::SessionStatus;

mod commands;
mod templates;

#[derive(Parser)]
#[command(name = "sandsync")]
#[command(
    author,
    version,
    about = "Run coding challenges in a sandbox: provision, sync edits, preview and test"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, global = true, env = "SANDSYNC_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default sandsync.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Provision a project and report whether it has a dev server
    Setup {
        /// Project JSON file or directory
        project: PathBuf,
    },

    /// Provision a project and run its tests
    Test {
        /// Project JSON file or directory
        project: PathBuf,

        /// Directory of edited files applied on top of the project
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Provision a project and run its dev server until Ctrl-C
    Dev {
        /// Project JSON file or directory
        project: PathBuf,
    },

    /// Drive a session with JSON requests on stdin
    Session {
        /// Project JSON file or directory
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
        Commands::Setup { project } => {
            commands::setup::run(&cli.config, &project).await?;
        }
        Commands::Test { project, dir } => {
            let status = commands::test::run(&cli.config, &project, dir.as_deref()).await?;
            if status != SessionStatus::Passed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Dev { project } => {
            commands::dev::run(&cli.config, &project).await?;
        }
        Commands::Session { project } => {
            commands::session::run(&cli.config, &project).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Sets up the global subscriber. `RUST_LOG` overrides the default filter.
fn init_logging(verbose: bool, log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let default = if verbose {
        "sandsync=debug"
    } else {
        "sandsync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}
