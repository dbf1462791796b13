pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to the default log file
    #[arg(long, global = true)]
    pub log: bool,

    /// Also write logs to a specific file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl every URL in a list file
    Crawl {
        /// File with one URL per line
        #[arg(required = true)]
        url_file: PathBuf,

        /// Configuration profile to use
        #[arg(short, long, default_value = "general")]
        profile: String,

        /// Proxy id from the proxy definition file
        #[arg(long)]
        proxy_id: Option<u32>,

        /// Proxy definition file
        #[arg(long)]
        proxy_file: Option<PathBuf>,

        /// Cap on URLs processed this run
        #[arg(long)]
        max_urls: Option<usize>,

        /// Concurrent URLs per batch
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Concurrent browser instances
        #[arg(long)]
        max_browsers: Option<usize>,

        /// Milliseconds between URL starts within a batch
        #[arg(short, long)]
        delay: Option<u64>,

        /// Run browsers with a visible window
        #[arg(long)]
        headful: bool,

        /// Re-check missing page structure after an extra settle wait
        #[arg(long)]
        aggressive: bool,

        /// Keep pages that fail content validation
        #[arg(long)]
        save_partial: bool,

        /// Recrawl URLs whose artifacts already exist
        #[arg(short, long)]
        force: bool,

        /// Output directory for crawled artifacts
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show which URLs from a list still need crawling, without crawling
    Filter {
        /// File with one URL per line
        #[arg(required = true)]
        url_file: PathBuf,

        /// Output directory to check against
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the proxies available in the proxy definition file
    ListProxies {
        /// Proxy definition file
        #[arg(long)]
        proxy_file: Option<PathBuf>,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            url_file,
            profile,
            proxy_id,
            proxy_file,
            max_urls,
            batch_size,
            max_browsers,
            delay,
            headful,
            aggressive,
            save_partial,
            force,
            output,
        } => {
            info!("Starting crawl from {} with profile {}", url_file.display(), profile);
            commands::crawl(commands::CrawlArgs {
                url_file,
                profile,
                proxy_id,
                proxy_file,
                max_urls,
                batch_size,
                max_browsers,
                delay,
                headful,
                aggressive,
                save_partial,
                force,
                output,
            })
            .await
        }
        Commands::Filter { url_file, output } => {
            info!("Filtering {} against existing artifacts", url_file.display());
            commands::filter(url_file, output).await
        }
        Commands::ListProxies { proxy_file } => commands::list_proxies(proxy_file).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn crawl_accepts_overrides() {
        let cli = Cli::parse_from([
            "ghostcrawler",
            "crawl",
            "urls.txt",
            "--batch-size",
            "10",
            "--max-browsers",
            "3",
            "--delay",
            "500",
            "--aggressive",
            "--force",
        ]);
        match cli.command {
            Commands::Crawl {
                batch_size,
                max_browsers,
                delay,
                aggressive,
                save_partial,
                force,
                ..
            } => {
                assert_eq!(batch_size, Some(10));
                assert_eq!(max_browsers, Some(3));
                assert_eq!(delay, Some(500));
                assert!(aggressive);
                assert!(!save_partial);
                assert!(force);
            }
            _ => panic!("expected crawl subcommand"),
        }
    }
}
