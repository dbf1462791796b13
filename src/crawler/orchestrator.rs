use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::blocker::ResourceBlocker;
use crate::browser::challenge::{ChallengeOutcome, ChallengeSolver};
use crate::browser::pool::{BrowserPool, BrowserSlot};
use crate::cli::config::CrawlerConfig;
use crate::crawler::extractor::Extractor;
use crate::crawler::memory::{BackpressureController, Throttle};
use crate::crawler::task::{AttemptError, CrawlOutcome, FailureRecord};
use crate::storage::failures::{write_progress_snapshot, FailureLog};
use crate::storage::saver::ArtifactSaver;
use crate::utils::stats::RunStatistics;

const BATCH_PAUSE: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Where the between-batch progress snapshot lands
const PROGRESS_FILE: &str = "crawl_progress.json";

/// Final accounting for one run
#[derive(Debug)]
pub struct RunSummary {
    pub stats: RunStatistics,
    pub interrupted: bool,
}

/// Drives a whole crawl: batches the URL list, runs each URL through its
/// page pipeline with retries, paces everything against memory pressure,
/// and keeps the failure journal and progress snapshot current.
pub struct CrawlOrchestrator {
    config: CrawlerConfig,
    pool: Arc<BrowserPool>,
    solver: ChallengeSolver,
    extractor: Arc<dyn Extractor>,
    saver: Arc<dyn ArtifactSaver>,
    failure_log: Arc<FailureLog>,
    backpressure: BackpressureController,
    challenges_encountered: AtomicUsize,
    challenges_solved: AtomicUsize,
    retries: AtomicUsize,
}

impl CrawlOrchestrator {
    pub fn new(
        config: CrawlerConfig,
        pool: Arc<BrowserPool>,
        extractor: Arc<dyn Extractor>,
        saver: Arc<dyn ArtifactSaver>,
        failure_log: Arc<FailureLog>,
        backpressure: BackpressureController,
    ) -> Self {
        let solver = ChallengeSolver::new(Duration::from_millis(config.challenge_timeout_ms));
        Self {
            config,
            pool,
            solver,
            extractor,
            saver,
            failure_log,
            backpressure,
            challenges_encountered: AtomicUsize::new(0),
            challenges_solved: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
        }
    }

    pub async fn run(
        &mut self,
        mut urls: Vec<String>,
        stop: watch::Receiver<bool>,
    ) -> Result<RunSummary> {
        if urls.len() > self.config.max_total_urls {
            warn!(
                given = urls.len(),
                limit = self.config.max_total_urls,
                "URL list exceeds the run limit, truncating"
            );
            urls.truncate(self.config.max_total_urls);
        }

        let mut stats = RunStatistics::new();
        info!(urls = urls.len(), batch_size = self.config.batch_size, "Starting crawl");

        let mut cursor = 0;
        while cursor < urls.len() {
            if *stop.borrow() {
                info!("Stop requested, not starting another batch");
                break;
            }

            let mut fan_out = self.config.batch_size;
            match self.backpressure.before_batch() {
                Throttle::Proceed => {}
                Throttle::Pause(pause) => sleep(pause).await,
                Throttle::PauseAndShrink(pause) => {
                    sleep(pause).await;
                    fan_out = (fan_out / 2).max(1);
                }
            }

            let batch_end = (cursor + fan_out).min(urls.len());
            let batch = &urls[cursor..batch_end];
            debug!(from = cursor, to = batch_end, "Dispatching batch");

            let this = &*self;
            let futures = batch.iter().enumerate().map(|(i, url)| {
                let stop = stop.clone();
                async move {
                    // Stagger starts so browsers don't all launch at once.
                    sleep(Duration::from_millis(this.config.url_delay_ms * i as u64)).await;
                    this.process_url(url, stop).await
                }
            });
            let outcomes = join_all(futures).await;

            for outcome in &outcomes {
                match outcome {
                    CrawlOutcome::Saved { path } => {
                        debug!(path = %path.display(), "Artifact recorded");
                        stats.record_saved();
                    }
                    CrawlOutcome::Failed { error, attempts } => {
                        debug!(%error, attempts, "URL exhausted its attempts");
                        stats.record_failed();
                    }
                    CrawlOutcome::Cancelled => {}
                }
            }
            cursor = batch_end;

            stats.challenges_encountered = self.challenges_encountered.load(Ordering::Relaxed);
            stats.challenges_solved = self.challenges_solved.load(Ordering::Relaxed);
            stats.retries = self.retries.load(Ordering::Relaxed);

            info!(
                done = cursor,
                total = urls.len(),
                saved = stats.files_saved,
                failed = stats.failed,
                "Batch complete"
            );
            if let Err(e) =
                write_progress_snapshot(Path::new(PROGRESS_FILE), &stats, &urls[cursor..]).await
            {
                warn!("Could not write progress snapshot: {}", e);
            }

            if cursor < urls.len() && !*stop.borrow() {
                sleep(BATCH_PAUSE).await;
            }
        }

        let interrupted = *stop.borrow();
        stats.log_summary();
        Ok(RunSummary { stats, interrupted })
    }

    /// Run one URL through the pipeline, retrying transient failures with
    /// exponential backoff. Terminal failures land in the failure journal.
    async fn process_url(&self, url: &str, stop: watch::Receiver<bool>) -> CrawlOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if *stop.borrow() {
                return CrawlOutcome::Cancelled;
            }

            match self.attempt(url, &stop).await {
                Ok(path) => {
                    info!(url, attempt, "URL crawled");
                    return CrawlOutcome::Saved { path };
                }
                Err(AttemptError::Cancelled) => return CrawlOutcome::Cancelled,
                Err(error) => {
                    if error.is_transient() && attempt < self.config.max_retries {
                        let delay = backoff_delay(attempt);
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        warn!(url, attempt, ?delay, "Attempt failed ({}), retrying", error);
                        sleep(delay).await;
                        continue;
                    }

                    warn!(url, attempts = attempt, "URL failed: {}", error);
                    if let Err(log_err) = self
                        .failure_log
                        .record(FailureRecord::new(url, &error))
                        .await
                    {
                        warn!(url, "Could not record failure: {}", log_err);
                    }
                    return CrawlOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    /// One attempt: fresh browser, full page pipeline, guaranteed release.
    async fn attempt(
        &self,
        url: &str,
        stop: &watch::Receiver<bool>,
    ) -> Result<PathBuf, AttemptError> {
        let mut acquire_stop = stop.clone();
        let mut slot = tokio::select! {
            _ = wait_for_stop(&mut acquire_stop) => return Err(AttemptError::Cancelled),
            slot = self.pool.acquire() => slot.map_err(AttemptError::from)?,
        };

        // One policy per page, so the counters describe this attempt only.
        let blocker = Arc::new(ResourceBlocker::new(&self.config));

        let mut stage_stop = stop.clone();
        let result = tokio::select! {
            _ = wait_for_stop(&mut stage_stop) => Err(AttemptError::Cancelled),
            result = self.run_stages(&mut slot, &blocker, url) => result,
        };

        self.pool.release(slot).await;
        debug!(
            url,
            allowed = blocker.allowed_count(),
            blocked = blocker.blocked_count(),
            "Request interception counts"
        );
        result
    }

    async fn run_stages(
        &self,
        slot: &mut BrowserSlot,
        blocker: &Arc<ResourceBlocker>,
        url: &str,
    ) -> Result<PathBuf, AttemptError> {
        blocker
            .attach(&mut *slot.page)
            .await
            .map_err(|e| AttemptError::Unexpected(format!("interception setup: {e}")))?;

        let navigation = slot
            .page
            .navigate(url, Duration::from_millis(self.config.navigation_timeout_ms))
            .await
            .map_err(|e| AttemptError::NavigationFailed(e.to_string()))?;
        // A missing status (engine never saw the document response) is
        // tolerated; an observed error status is not.
        if navigation.status.is_some() && !navigation.is_success() {
            return Err(AttemptError::NavigationFailed(format!(
                "status {:?}",
                navigation.status
            )));
        }

        // Let the page settle before checking for a challenge widget, so a
        // widget that mounts during the first burst of requests is not missed.
        if let Err(e) = slot
            .page
            .wait_for_network_idle(Duration::from_millis(self.config.network_idle_timeout_ms))
            .await
        {
            debug!(url, "Network idle wait failed: {}", e);
        }
        if self.config.aggressive_wait_mode {
            sleep(Duration::from_millis(self.config.stability_wait_ms)).await;
        }

        if self.solver.detect(&*slot.page).await {
            self.challenges_encountered.fetch_add(1, Ordering::Relaxed);
            match self.solver.solve(&*slot.page).await {
                ChallengeOutcome::Solved => {
                    self.challenges_solved.fetch_add(1, Ordering::Relaxed);
                    sleep(Duration::from_millis(self.config.post_challenge_wait_ms)).await;
                }
                outcome => {
                    return Err(AttemptError::ChallengeFailed(format!("{outcome:?}")));
                }
            }
        }

        let element_timeout = Duration::from_millis(self.config.element_timeout_ms);
        for selector in &self.config.required_selectors {
            let mut present = slot
                .page
                .wait_for_selector(selector, element_timeout)
                .await
                .map_err(|e| AttemptError::Unexpected(format!("selector wait: {e}")))?;
            if !present && self.config.aggressive_wait_mode {
                // Slow pages sometimes render the spec table well after load;
                // give the page one more settle window before giving up.
                debug!(url, selector, "Required element missing, re-checking");
                let _ = slot
                    .page
                    .wait_for_network_idle(Duration::from_millis(
                        self.config.network_idle_timeout_ms,
                    ))
                    .await;
                present = slot
                    .page
                    .wait_for_selector(selector, element_timeout)
                    .await
                    .map_err(|e| AttemptError::Unexpected(format!("selector wait: {e}")))?;
            }
            if !present {
                return Err(AttemptError::ElementMissing(selector.clone()));
            }
        }

        // Nice-to-have page parts; their absence is logged, never fatal.
        for selector in &self.config.optional_selectors {
            match slot.page.wait_for_selector(selector, element_timeout).await {
                Ok(true) => {}
                Ok(false) => debug!(url, selector, "Optional element absent"),
                Err(e) => debug!(url, selector, "Optional element check failed: {}", e),
            }
        }

        let data = self.extractor.extract(&*slot.page, url).await?;
        self.saver.save(&data).await
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << (attempt.saturating_sub(1)).min(4);
    (BACKOFF_BASE * factor).min(BACKOFF_MAX)
}

/// Resolve when the stop flag turns true; never resolve otherwise
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a stop; treat as "never".
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::engine::{
        BrowserHandle, EngineError, MockBrowserEngine, MockBrowserHandle, MockPageHandle,
        NavigationResult, PageHandle,
    };
    use crate::crawler::extractor::{MockExtractor, PageData};
    use crate::crawler::memory::MockMemoryProbe;
    use crate::storage::saver::MockArtifactSaver;

    fn good_page() -> MockPageHandle {
        let mut page = MockPageHandle::new();
        page.expect_set_request_policy().returning(|_| Ok(()));
        page.expect_navigate()
            .returning(|_, _| Ok(NavigationResult { status: Some(200) }));
        // No challenge widget present.
        page.expect_element_count().returning(|_| Ok(0));
        page.expect_wait_for_network_idle().returning(|_| Ok(()));
        page.expect_wait_for_selector().returning(|_, _| Ok(true));
        page.expect_close().returning(|| Ok(()));
        page
    }

    fn browser_with(page_factory: fn() -> MockPageHandle) -> Box<dyn BrowserHandle> {
        let mut browser = MockBrowserHandle::new();
        browser
            .expect_new_page()
            .returning(move || Ok(Box::new(page_factory()) as Box<dyn PageHandle>));
        browser.expect_close().returning(|| Ok(()));
        Box::new(browser)
    }

    fn calm_probe() -> Box<MockMemoryProbe> {
        let mut probe = MockMemoryProbe::new();
        probe.expect_system_used_pct().returning(|| 40.0);
        probe.expect_process_rss_mb().returning(|| 1_000);
        Box::new(probe)
    }

    struct Fixture {
        orchestrator: CrawlOrchestrator,
        pool: Arc<BrowserPool>,
        dir: tempfile::TempDir,
    }

    fn fixture(
        engine: MockBrowserEngine,
        extractor: MockExtractor,
        saver: MockArtifactSaver,
        config: CrawlerConfig,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(BrowserPool::new(Arc::new(engine), &config));
        let failure_log = Arc::new(FailureLog::new(dir.path().join("failure_reasons.json")));
        let backpressure = BackpressureController::new(calm_probe(), &config);
        Fixture {
            orchestrator: CrawlOrchestrator::new(
                config,
                Arc::clone(&pool),
                Arc::new(extractor),
                Arc::new(saver),
                failure_log,
                backpressure,
            ),
            pool,
            dir,
        }
    }

    fn quiet_config() -> CrawlerConfig {
        CrawlerConfig {
            max_browsers: 2,
            batch_size: 2,
            url_delay_ms: 0,
            ..Default::default()
        }
    }

    fn running() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the channel open for the whole run.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn crawls_and_saves_every_url() {
        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(2)
            .returning(|_, _| Ok(browser_with(good_page)));

        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract()
            .times(2)
            .returning(|_, url| {
                Ok(PageData {
                    url: url.to_string(),
                    ..Default::default()
                })
            });

        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(2)
            .returning(|data| Ok(PathBuf::from(format!("{}.html", data.url))));

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec![
                    "https://site.example/motorcycles-specs/acme/model-x".to_string(),
                    "https://site.example/motorcycles-specs/acme/model-y".to_string(),
                ],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.files_saved, 2);
        assert_eq!(summary.stats.failed, 0);
        assert!(!summary.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_failures_are_not_retried() {
        let mut engine = MockBrowserEngine::new();
        // A retry would need a second browser.
        engine
            .expect_launch()
            .times(1)
            .returning(|_, _| Ok(browser_with(good_page)));

        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract()
            .times(1)
            .returning(|_, _| Err(AttemptError::ValidationFailed("empty specs".to_string())));

        let mut saver = MockArtifactSaver::new();
        saver.expect_save().never();

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_navigation_failures_get_fresh_browsers() {
        fn broken_page() -> MockPageHandle {
            let mut page = MockPageHandle::new();
            page.expect_set_request_policy().returning(|_| Ok(()));
            page.expect_navigate()
                .returning(|_, _| Err(EngineError::Protocol("net::ERR_RESET".to_string())));
            page.expect_close().returning(|| Ok(()));
            page
        }

        let mut engine = MockBrowserEngine::new();
        let mut launches = 0;
        engine.expect_launch().times(2).returning(move |_, _| {
            launches += 1;
            if launches == 1 {
                Ok(browser_with(broken_page))
            } else {
                Ok(browser_with(good_page))
            }
        });

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().times(1).returning(|_, url| {
            Ok(PageData {
                url: url.to_string(),
                ..Default::default()
            })
        });

        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Ok(PathBuf::from("out.html")));

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.files_saved, 1);
        assert_eq!(summary.stats.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_set_stop_flag_crawls_nothing() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().never();

        let extractor = MockExtractor::new();
        let saver = MockArtifactSaver::new();

        let (tx, rx) = watch::channel(true);
        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                rx,
            )
            .await
            .unwrap();
        drop(tx);

        assert_eq!(summary.stats.processed, 0);
        assert!(summary.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn url_list_is_truncated_to_the_run_limit() {
        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(1)
            .returning(|_, _| Ok(browser_with(good_page)));

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().times(1).returning(|_, url| {
            Ok(PageData {
                url: url.to_string(),
                ..Default::default()
            })
        });

        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Ok(PathBuf::from("out.html")));

        let config = CrawlerConfig {
            max_total_urls: 1,
            ..quiet_config()
        };
        let mut fx = fixture(engine, extractor, saver, config);
        let summary = fx
            .orchestrator
            .run(
                vec![
                    "https://site.example/motorcycles-specs/acme/model-x".to_string(),
                    "https://site.example/motorcycles-specs/acme/model-y".to_string(),
                ],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aggressive_mode_rechecks_late_rendering_structure() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().times(1).returning(|_, _| {
            let mut browser = MockBrowserHandle::new();
            browser.expect_new_page().returning(|| {
                let mut page = MockPageHandle::new();
                page.expect_set_request_policy().returning(|_| Ok(()));
                page.expect_navigate()
                    .returning(|_, _| Ok(NavigationResult { status: Some(200) }));
                page.expect_element_count().returning(|_| Ok(0));
                page.expect_wait_for_network_idle().returning(|_| Ok(()));
                // The first selector shows up only on the re-check.
                let checks = AtomicU32::new(0);
                page.expect_wait_for_selector()
                    .returning(move |_, _| Ok(checks.fetch_add(1, Ordering::SeqCst) > 0));
                page.expect_close().returning(|| Ok(()));
                Ok(Box::new(page) as Box<dyn PageHandle>)
            });
            browser.expect_close().returning(|| Ok(()));
            Ok(Box::new(browser) as Box<dyn BrowserHandle>)
        });

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().times(1).returning(|_, url| {
            Ok(PageData {
                url: url.to_string(),
                ..Default::default()
            })
        });
        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Ok(PathBuf::from("out.html")));

        let config = CrawlerConfig {
            aggressive_wait_mode: true,
            ..quiet_config()
        };
        let mut fx = fixture(engine, extractor, saver, config);
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.files_saved, 1);
        assert_eq!(summary.stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_structure_fails_without_retry() {
        fn thin_page() -> MockPageHandle {
            let mut page = MockPageHandle::new();
            page.expect_set_request_policy().returning(|_| Ok(()));
            page.expect_navigate()
                .returning(|_, _| Ok(NavigationResult { status: Some(200) }));
            page.expect_element_count().returning(|_| Ok(0));
            page.expect_wait_for_network_idle().returning(|_| Ok(()));
            page.expect_wait_for_selector().returning(|_, _| Ok(false));
            page.expect_close().returning(|| Ok(()));
            page
        }

        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(1)
            .returning(|_, _| Ok(browser_with(thin_page)));

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().never();
        let saver = MockArtifactSaver::new();

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn large_lists_run_in_batches_and_drain_the_pool() {
        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(25)
            .returning(|_, _| Ok(browser_with(good_page)));

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().times(25).returning(|_, url| {
            Ok(PageData {
                url: url.to_string(),
                ..Default::default()
            })
        });

        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(25)
            .returning(|data| Ok(PathBuf::from(format!("{}.html", data.url))));

        // More URLs per batch than browsers, so acquires must wait their turn.
        let config = CrawlerConfig {
            batch_size: 10,
            max_browsers: 5,
            url_delay_ms: 0,
            ..Default::default()
        };
        let urls = (0..25)
            .map(|i| format!("https://site.example/motorcycles-specs/acme/model-{i}"))
            .collect();

        let mut fx = fixture(engine, extractor, saver, config);
        let summary = fx.orchestrator.run(urls, running()).await.unwrap();

        assert_eq!(summary.stats.processed, 25);
        assert_eq!(summary.stats.files_saved, 25);
        assert_eq!(summary.stats.failed, 0);
        assert_eq!(fx.pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn page_settles_before_challenge_detection() {
        use std::sync::atomic::AtomicBool;

        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().times(1).returning(|_, _| {
            let mut browser = MockBrowserHandle::new();
            browser.expect_new_page().returning(|| {
                let mut page = MockPageHandle::new();
                page.expect_set_request_policy().returning(|_| Ok(()));
                page.expect_navigate()
                    .returning(|_, _| Ok(NavigationResult { status: Some(200) }));
                let settled = Arc::new(AtomicBool::new(false));
                {
                    let settled = Arc::clone(&settled);
                    page.expect_wait_for_network_idle().returning(move |_| {
                        settled.store(true, Ordering::SeqCst);
                        Ok(())
                    });
                }
                page.expect_element_count().returning(move |_| {
                    assert!(
                        settled.load(Ordering::SeqCst),
                        "challenge check ran before the page settled"
                    );
                    Ok(0)
                });
                page.expect_wait_for_selector().returning(|_, _| Ok(true));
                page.expect_close().returning(|| Ok(()));
                Ok(Box::new(page) as Box<dyn PageHandle>)
            });
            browser.expect_close().returning(|| Ok(()));
            Ok(Box::new(browser) as Box<dyn BrowserHandle>)
        });

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().times(1).returning(|_, url| {
            Ok(PageData {
                url: url.to_string(),
                ..Default::default()
            })
        });
        let mut saver = MockArtifactSaver::new();
        saver
            .expect_save()
            .times(1)
            .returning(|_| Ok(PathBuf::from("out.html")));

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.files_saved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolved_challenges_are_retried_then_logged() {
        fn challenged_page() -> MockPageHandle {
            let mut page = MockPageHandle::new();
            page.expect_set_request_policy().returning(|_| Ok(()));
            page.expect_navigate()
                .returning(|_, _| Ok(NavigationResult { status: Some(200) }));
            page.expect_wait_for_network_idle().returning(|_| Ok(()));
            // Widget present but it never turns visible, so solving times out.
            page.expect_element_count().returning(|_| Ok(1));
            page.expect_is_visible().returning(|_| Ok(false));
            page.expect_close().returning(|| Ok(()));
            page
        }

        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(3)
            .returning(|_, _| Ok(browser_with(challenged_page)));

        let mut extractor = MockExtractor::new();
        extractor.expect_extract().never();
        let saver = MockArtifactSaver::new();

        let mut fx = fixture(engine, extractor, saver, quiet_config());
        let summary = fx
            .orchestrator
            .run(
                vec!["https://site.example/motorcycles-specs/acme/model-x".to_string()],
                running(),
            )
            .await
            .unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.stats.retries, 2);
        assert_eq!(summary.stats.challenges_encountered, 3);
        assert_eq!(summary.stats.challenges_solved, 0);
        assert_eq!(fx.pool.active_count(), 0);

        let journal =
            std::fs::read_to_string(fx.dir.path().join("failure_reasons.json")).unwrap();
        assert!(journal.contains("challenge_failed"));
        assert!(journal.contains("model-x"));
    }
}
