use anyhow::Result;
use tracing::{error, info};

mod browser;
mod cli;
mod crawler;
mod proxy;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let log_file = args
        .log_file
        .clone()
        .or_else(|| args.log.then(utils::logging::default_log_file));
    utils::logging::init_logging(args.verbose, log_file)?;

    info!("Starting GhostCrawler v{}", env!("CARGO_PKG_VERSION"));

    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
