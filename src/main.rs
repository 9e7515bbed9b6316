use anyhow::Result;
use tracing::{error, info};

mod browser;
mod cli;
mod crawler;
mod fetch;
mod notify;
mod proxy;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = args.log_file.clone().unwrap_or_else(utils::default_log_file);
    utils::init_logging(args.verbose, Some(log_file))?;

    info!("Starting listing watcher v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
