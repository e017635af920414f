use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

use tfm_remote::config::ConfigManager;
use tfm_remote::hosts::HostRegistry;
use tfm_remote::remote::{self, ConnectionManager, ProcessRunner, ResultCache};

mod commands;

#[derive(Parser)]
#[command(name = "tfm-remote")]
#[command(about = "Browse and transfer files on SSH hosts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print result cache statistics on exit
    #[arg(long, global = true)]
    cache_stats: bool,

    /// Use this directory instead of the platform config directory
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured hosts, optionally fuzzy-filtered
    Hosts { query: Option<String> },

    /// List a remote directory (ssh://host/path)
    Ls { uri: String },

    /// Show metadata of a remote path
    Stat { uri: String },

    /// Download a remote file
    Get {
        uri: String,
        /// Local destination (default: remote file name in the current directory)
        dest: Option<PathBuf>,
    },

    /// Upload a local file
    Put { src: PathBuf, uri: String },

    /// Delete a remote file
    Rm { uri: String },

    /// Delete an empty remote directory
    Rmdir { uri: String },

    /// Create a remote directory
    Mkdir { uri: String },

    /// Rename a remote path on the same host
    Mv { uri: String, new_path: String },
}

fn init_logging(log_dir: &Path) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    let log_file = log_dir.join(format!(
        "tfm-remote_{}.log",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = File::create(&log_file).context("Failed to create log file")?;

    fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(EnvFilter::from_default_env().add_directive("tfm_remote=debug".parse()?))
        .with_ansi(false)
        .with_writer(file)
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config_dir {
        Some(dir) => ConfigManager::with_dir(dir)?,
        None => ConfigManager::new()?,
    };
    let config = config_manager.load_config()?;
    init_logging(&config_manager.log_dir(&config))?;
    debug!("Starting tfm-remote...");

    let registry = HostRegistry::load(&config_manager, Path::new(&config.ssh_file_config))?;
    let cache = ResultCache::install(&config.cache)?;
    let runner = Arc::new(ProcessRunner::new().context("Failed to start process runtime")?);
    ConnectionManager::install(config.connection.clone(), runner, cache.clone())?;

    let result = commands::run(&cli.command, &registry, cli.json);
    remote::shutdown();

    if cli.cache_stats {
        eprintln!("{}", serde_json::to_string_pretty(&cache.get_stats())?);
    }

    result
}
