//! bisq - application version switcher
//!
//! `bisq init` writes a starter configuration; `bisq server start` runs the
//! controller until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bisq_controller::config::DEFAULT_CONFIG_FILE;
use bisq_controller::{Config, Controller, GitSource};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// bisq - run tagged app versions and route traffic to the latest one.
#[derive(Debug, Parser)]
#[command(name = "bisq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a default configuration file.
    Init {
        /// Path of the configuration file to create.
        #[arg(long, short, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Manage the controller server.
    #[command(subcommand)]
    Server(ServerCommand),
}

#[derive(Debug, Subcommand)]
enum ServerCommand {
    /// Start the controller.
    Start {
        /// Path of the configuration file.
        #[arg(long, short, env = "BISQ_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { config } => init(config),
        Commands::Server(ServerCommand::Start { config }) => start(config).await,
    }
}

fn init(path: PathBuf) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    Config::default()
        .write_to(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn start(path: PathBuf) -> Result<()> {
    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    // Initialize tracing (prefer RUST_LOG, fallback to the configured level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bisq");
    info!(
        config = %path.display(),
        repo_url = %config.repository.github.repo_url,
        workspace_dir = %config.workspace_dir.display(),
        "Configuration loaded"
    );

    let source = Arc::new(GitSource::new(
        config.repository.github.repo_url.clone(),
        config.repository.github.api_key.clone(),
        &config.workspace_dir,
    ));

    let controller = match Controller::bind(config, source).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Failed to start controller");
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut server => {
            // Controller exited on its own.
            result.context("controller task panicked")??;
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    server
        .await
        .context("controller task panicked")?
        .context("controller failed")?;

    info!("bisq shutdown complete");
    Ok(())
}
