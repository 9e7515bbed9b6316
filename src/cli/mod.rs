pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::WatcherConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to default.yaml in the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch all subscriptions until interrupted
    Run,

    /// Run a single sweep over all subscriptions and exit
    Sweep,

    /// Fetch one results page and print its listings
    Lookup {
        /// Results page URL
        #[arg(required = true)]
        url: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the exit IP of every configured proxy
    Proxies,

    /// Show the effective configuration
    Config {
        /// Write a default configuration file instead
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init: true } = cli.command {
        let path = cli.config.unwrap_or_else(WatcherConfig::default_path);
        info!("Writing default configuration to {}", path.display());
        return commands::init_config(&path);
    }

    let config = WatcherConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            info!("Starting watcher with {} subscriptions", config.subscriptions.len());
            commands::run(config).await
        }
        Commands::Sweep => {
            info!("Running a single sweep");
            commands::sweep(config).await
        }
        Commands::Lookup { url, json } => {
            info!("Looking up {}", url);
            commands::lookup(config, &url, json).await
        }
        Commands::Proxies => {
            info!("Checking proxies");
            commands::check_proxies(config).await
        }
        Commands::Config { .. } => commands::show_config(&config),
    }
}
