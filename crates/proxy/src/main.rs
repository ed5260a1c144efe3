//! Concord - Main entry point
//!
//! Runs one node of the replicated reverse-proxy control plane.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use concord_common::{init_tracing, LogFormat};
use concord_config::Config;
use concord_proxy::Node;

/// Concord - replicated reverse-proxy control plane
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CONCORD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Also dial every backend
        #[arg(long = "network")]
        network: bool,
    },
    /// Run the node (default)
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Some(Commands::Test { network }) => {
            runtime.block_on(test_config(cli.config.as_deref(), network, cli.verbose))
        }
        Some(Commands::Run) | None => runtime.block_on(run_node(cli.config.as_deref(), cli.verbose)),
    }
}

/// Read the configuration. Runs before tracing is installed, so it does not log.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn log_config_source(path: Option<&Path>) {
    match path {
        Some(path) => info!(path = ?path, "Configuration loaded"),
        None => info!("No configuration specified, using defaults"),
    }
}

/// Log level and format for `run`. `--verbose` forces debug.
fn tracing_settings(config: &Config, verbose: bool) -> Result<(&str, LogFormat)> {
    let level = if verbose { "debug" } else { config.log.level.as_str() };
    let format: LogFormat = config.log.format.parse().context("Invalid log format")?;
    Ok((level, format))
}

/// Test configuration file and exit
async fn test_config(path: Option<&Path>, network: bool, verbose: bool) -> Result<()> {
    init_tracing(if verbose { "debug" } else { "info" }, LogFormat::Pretty);

    let config = load_config(path)?;
    log_config_source(path);
    let result = config.validate().context("Configuration validation failed")?;
    for warning in &result.warnings {
        warn!("{}", warning.message);
    }

    if network {
        let network_result = concord_config::validate::network::validate_backends(&config).await;
        for warning in &network_result.warnings {
            warn!("{}", warning.message);
        }
        if network_result.has_errors() {
            anyhow::bail!("Backend connectivity check failed: {}", network_result);
        }
    }

    info!("Configuration test successful:");
    info!("  - {} location(s)", config.locations.len());
    info!("  - {} warning(s)", result.warnings.len());

    println!(
        "concord: configuration file {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}

/// Run the node until SIGINT/SIGTERM
async fn run_node(path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(path)?;

    let (level, format) = tracing_settings(&config, verbose)?;
    init_tracing(level, format);
    log_config_source(path);

    let result = config.validate().context("Configuration validation failed")?;
    for warning in &result.warnings {
        warn!("{}", warning.message);
    }

    let node = Node::build(config).context("Failed to build node")?;
    node.start().await.context("Failed to start node")?;

    info!(
        node = %node.name(),
        pools = node.table().len(),
        "Concord node started"
    );

    let index = node
        .run_until_signal()
        .await
        .context("Graceful shutdown failed")?;
    info!(node = %node.name(), index = %index, "Concord node exited");
    Ok(())
}
