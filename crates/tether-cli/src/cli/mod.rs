//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version = "0.1")]
#[command(about = "Mirror a server's state from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Server endpoint (overrides the config file)
    #[arg(long, value_name = "URL", global = true)]
    endpoint: Option<String>,

    /// Path to a TOML config file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Stream live state changes for a directory
    Watch {
        /// Directory scope to observe
        #[arg(long, default_value = ".")]
        directory: String,
    },
    /// Probe server liveness once
    Health,
    /// List retained sessions for a directory
    Sessions {
        /// Directory scope to query
        #[arg(long, default_value = ".")]
        directory: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = match cli.config.as_deref() {
        Some(path) => SyncConfig::load_from(path).context("load config")?,
        None => SyncConfig::default(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }

    // default to watching the current directory
    let Some(command) = cli.command else {
        return commands::watch::run(config, ".").await;
    };

    match command {
        Commands::Watch { directory } => commands::watch::run(config, &directory).await,
        Commands::Health => commands::health::run(config).await,
        Commands::Sessions { directory, json } => {
            commands::sessions::run(config, &directory, json).await
        }
    }
}
