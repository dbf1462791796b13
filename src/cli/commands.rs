use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::browser::chromium::ChromiumEngine;
use crate::browser::pool::BrowserPool;
use crate::cli::config::CrawlerConfig;
use crate::crawler::extractor::SpecExtractor;
use crate::crawler::memory::{BackpressureController, SysinfoProbe};
use crate::crawler::orchestrator::CrawlOrchestrator;
use crate::proxy;
use crate::storage::dedup::Deduplicator;
use crate::storage::failures::FailureLog;
use crate::storage::saver::HtmlSaver;
use crate::utils::urls;

const FAILURE_LOG_FILE: &str = "logs/failure_reasons.json";

pub struct CrawlArgs {
    pub url_file: PathBuf,
    pub profile: String,
    pub proxy_id: Option<u32>,
    pub proxy_file: Option<PathBuf>,
    pub max_urls: Option<usize>,
    pub batch_size: Option<usize>,
    pub max_browsers: Option<usize>,
    pub delay: Option<u64>,
    pub headful: bool,
    pub aggressive: bool,
    pub save_partial: bool,
    pub force: bool,
    pub output: Option<PathBuf>,
}

/// Run a full crawl over a URL list file
pub async fn crawl(args: CrawlArgs) -> Result<()> {
    let mut config = CrawlerConfig::load_profile(&args.profile)?;

    if let Some(max_urls) = args.max_urls {
        config.max_total_urls = max_urls;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(max_browsers) = args.max_browsers {
        config.max_browsers = max_browsers;
    }
    if let Some(delay) = args.delay {
        config.url_delay_ms = delay;
    }
    if args.headful {
        config.headless = false;
    }
    if args.aggressive {
        config.aggressive_wait_mode = true;
    }
    if args.save_partial {
        config.save_partial_data = true;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    let (config, corrections) = config.validated();
    for correction in &corrections {
        warn!(field = correction.field, "Config out of range: {}", correction.applied);
    }

    let selected = match args.proxy_id {
        Some(id) => {
            let entries = proxy::load_proxies(args.proxy_file.as_deref())?;
            Some(proxy::select_proxy(&entries, id)?)
        }
        None => None,
    };
    let mut config = config;
    config.proxy = proxy::resolve(selected);

    let raw_urls = urls::load_url_file(&args.url_file)?;

    // Clean the list first, so only well-formed URLs reach the dedup pass
    // and its quarantine file.
    let report = urls::validate_and_deduplicate(raw_urls);
    if report.valid.is_empty() {
        warn!("No valid URLs in the input list");
        return Ok(());
    }
    let dedup = Deduplicator::new(&config.output_dir);
    let (remaining, filter_stats) = dedup.filter(report.valid, args.force);
    if filter_stats.to_process == 0 {
        info!("Every URL in the list already has an artifact, nothing to do");
        return Ok(());
    }

    let engine = Arc::new(ChromiumEngine::new());
    let pool = Arc::new(BrowserPool::new(engine, &config));
    let extractor = Arc::new(SpecExtractor::new(
        config.min_content_length,
        config.save_partial_data,
    )?);
    let saver = Arc::new(HtmlSaver::new(config.output_dir.clone()));
    let failure_log = Arc::new(FailureLog::new(PathBuf::from(FAILURE_LOG_FILE)));
    let backpressure = BackpressureController::new(Box::new(SysinfoProbe::new()), &config);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight URLs");
            let _ = stop_tx.send(true);
        }
    });

    let mut orchestrator = CrawlOrchestrator::new(
        config,
        Arc::clone(&pool),
        extractor,
        saver,
        failure_log,
        backpressure,
    );
    let summary = orchestrator
        .run(remaining, stop_rx)
        .await
        .context("Crawl run failed")?;

    pool.shutdown().await;

    if summary.interrupted {
        warn!("Crawl interrupted before completing the URL list");
    }
    Ok(())
}

/// Dry-run the dedup pass and report what a crawl would actually do
pub async fn filter(url_file: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let config = CrawlerConfig::default();
    let output_dir = output.unwrap_or(config.output_dir);

    let raw_urls = urls::load_url_file(&url_file)?;
    let total = raw_urls.len();
    let report = urls::validate_and_deduplicate(raw_urls);
    let dedup = Deduplicator::new(&output_dir);
    let (remaining, stats) = dedup.filter(report.valid, false);

    info!(
        total,
        invalid = report.invalid_scheme + report.malformed,
        already_crawled = stats.already_crawled,
        unrecognized = stats.unrecognized,
        would_crawl = remaining.len(),
        "Filter result"
    );
    Ok(())
}

/// Show the proxies defined in the proxy file
pub async fn list_proxies(proxy_file: Option<PathBuf>) -> Result<()> {
    let entries = proxy::load_proxies(proxy_file.as_deref())?;
    if entries.is_empty() {
        info!("No proxies defined");
        return Ok(());
    }

    for entry in entries {
        match proxy::parse_proxy_url(&entry.url) {
            // Print the parsed server only, never the credentials.
            Ok(creds) => info!(id = entry.id, name = %entry.name, server = %creds.server, "proxy"),
            Err(e) => error!(id = entry.id, name = %entry.name, "unparseable proxy url: {}", e),
        }
    }
    Ok(())
}
