use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::browser::engine::{
    BrowserEngine, BrowserHandle, EngineError, LaunchOptions, PageHandle,
};
use crate::browser::persona::OsPersona;
use crate::cli::config::CrawlerConfig;

/// How long an acquire call waits for a capacity slot to open
const ACQUIRE_WINDOW: Duration = Duration::from_secs(60);
const ACQUIRE_POLL: Duration = Duration::from_millis(100);
/// Budget for launching a browser and opening its first page
const CREATION_TIMEOUT: Duration = Duration::from_secs(30);

const PAGE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const BROWSER_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
const GRACEFUL_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);
const FORCED_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("no browser slot freed up within {0:?}")]
    Exhausted(Duration),

    #[error("browser creation failed: {0}")]
    CreationFailed(#[from] EngineError),
}

/// One leased browser instance with its single working page
pub struct BrowserSlot {
    pub id: u64,
    pub persona: OsPersona,
    pub browser: Box<dyn BrowserHandle>,
    pub page: Box<dyn PageHandle>,
    pub created_at: Instant,
}

/// One reserved capacity unit. Gives the unit back on drop unless the
/// reservation was committed to a live slot, so a caller cancelled mid-way
/// through browser creation cannot leak capacity.
struct Reservation<'a> {
    pool: &'a BrowserPool,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.forfeit();
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Instances currently counted against capacity
    active: usize,
    /// Monotonic creation counter, also the next slot id
    total_created: u64,
}

/// Bounded pool of single-page browser instances. Browsers are created fresh
/// on acquire and destroyed on release; only the capacity accounting is
/// shared. A unit reserved for a creation that fails, times out, or is
/// cancelled is always given back.
pub struct BrowserPool {
    engine: Arc<dyn BrowserEngine>,
    max_browsers: usize,
    launch_options: LaunchOptions,
    state: Mutex<PoolState>,
}

impl BrowserPool {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: &CrawlerConfig) -> Self {
        Self {
            engine,
            max_browsers: config.max_browsers,
            launch_options: LaunchOptions {
                headless: config.headless,
                humanize: config.humanize,
                geoip: config.geoip,
                block_webrtc: config.block_webrtc,
                locale: "en-US".to_string(),
                proxy: config.proxy.clone(),
            },
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The lock only guards two counters and is never held across an await;
    /// a poisoned guard still carries valid counts.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Instances currently counted against capacity
    pub fn active_count(&self) -> usize {
        self.lock_state().active
    }

    /// Wait for a capacity slot, then create a fresh browser and page for it.
    /// The reservation is forfeited if creation fails, times out, or the
    /// caller is cancelled while the browser is still starting.
    pub async fn acquire(&self) -> Result<BrowserSlot, AcquireError> {
        let deadline = Instant::now() + ACQUIRE_WINDOW;

        let slot_id = loop {
            {
                let mut state = self.lock_state();
                if state.active < self.max_browsers {
                    state.active += 1;
                    let id = state.total_created;
                    state.total_created += 1;
                    break id;
                }
            }
            if Instant::now() >= deadline {
                warn!(window = ?ACQUIRE_WINDOW, "Browser pool exhausted");
                return Err(AcquireError::Exhausted(ACQUIRE_WINDOW));
            }
            sleep(ACQUIRE_POLL).await;
        };

        let reservation = Reservation {
            pool: self,
            committed: false,
        };

        match timeout(CREATION_TIMEOUT, self.create_slot(slot_id)).await {
            Ok(Ok(slot)) => {
                reservation.commit();
                debug!(slot = slot_id, persona = slot.persona.name(), "Browser created");
                Ok(slot)
            }
            Ok(Err(e)) => Err(AcquireError::CreationFailed(e)),
            Err(_) => Err(AcquireError::CreationFailed(EngineError::Timeout(
                CREATION_TIMEOUT,
            ))),
        }
    }

    async fn create_slot(&self, slot_id: u64) -> Result<BrowserSlot, EngineError> {
        let persona = OsPersona::for_slot(slot_id);
        let mut browser = self.engine.launch(&persona, &self.launch_options).await?;
        let page = match browser.new_page().await {
            Ok(page) => page,
            Err(e) => {
                if let Err(close_err) = browser.close().await {
                    debug!("Cleanup close after failed page open: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(BrowserSlot {
            id: slot_id,
            persona,
            browser,
            page,
            created_at: Instant::now(),
        })
    }

    /// Tear down a slot's browser and free its capacity. Close failures are
    /// logged, never raised; the capacity decrement is unconditional.
    pub async fn release(&self, mut slot: BrowserSlot) {
        let graceful = async {
            if let Err(e) = timeout(PAGE_CLOSE_TIMEOUT, slot.page.close())
                .await
                .unwrap_or(Err(EngineError::Timeout(PAGE_CLOSE_TIMEOUT)))
            {
                warn!(slot = slot.id, "Page close failed: {}", e);
            }
            if let Err(e) = timeout(BROWSER_CLOSE_TIMEOUT, slot.browser.close())
                .await
                .unwrap_or(Err(EngineError::Timeout(BROWSER_CLOSE_TIMEOUT)))
            {
                warn!(slot = slot.id, "Browser close failed: {}", e);
            }
        };

        if timeout(GRACEFUL_RELEASE_TIMEOUT, graceful).await.is_err() {
            warn!(slot = slot.id, "Graceful teardown stalled, forcing close");
            let _ = timeout(FORCED_CLOSE_TIMEOUT, slot.page.close()).await;
            let _ = timeout(FORCED_CLOSE_TIMEOUT, slot.browser.close()).await;
        }

        self.forfeit();
        debug!(slot = slot.id, lifetime = ?slot.created_at.elapsed(), "Browser released");
    }

    fn forfeit(&self) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
    }

    /// Stop the underlying engine. Call after all slots have been released.
    pub async fn shutdown(&self) {
        let active = self.active_count();
        if active > 0 {
            warn!(active, "Shutting down pool with live browsers");
        }
        if let Err(e) = self.engine.shutdown().await {
            warn!("Engine shutdown failed: {}", e);
        }
        info!("Browser pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::engine::{MockBrowserEngine, MockBrowserHandle, MockPageHandle};

    fn working_browser() -> Box<dyn BrowserHandle> {
        let mut browser = MockBrowserHandle::new();
        browser.expect_new_page().returning(|| {
            let mut page = MockPageHandle::new();
            page.expect_close().returning(|| Ok(()));
            Ok(Box::new(page) as Box<dyn PageHandle>)
        });
        browser.expect_close().returning(|| Ok(()));
        Box::new(browser)
    }

    fn pool_with(engine: MockBrowserEngine, max_browsers: usize) -> BrowserPool {
        let config = CrawlerConfig {
            max_browsers,
            ..Default::default()
        };
        BrowserPool::new(Arc::new(engine), &config)
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_and_release_round_trip() {
        let mut engine = MockBrowserEngine::new();
        engine
            .expect_launch()
            .times(1)
            .returning(|_, _| Ok(working_browser()));

        let pool = pool_with(engine, 2);
        let slot = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(slot.id, 0);
        assert_eq!(slot.persona, OsPersona::Windows);

        pool.release(slot).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cap_is_enforced() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().returning(|_, _| Ok(working_browser()));

        let pool = pool_with(engine, 1);
        let _held = pool.acquire().await.unwrap();

        // Second acquire can never get a slot; paused time fast-forwards
        // through the whole wait window.
        match pool.acquire().await {
            Err(AcquireError::Exhausted(_)) => {}
            other => panic!("expected exhaustion, got {:?}", other.map(|s| s.id)),
        }
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_returns_the_reserved_slot() {
        let mut engine = MockBrowserEngine::new();
        let mut launches = 0;
        engine.expect_launch().returning(move |_, _| {
            launches += 1;
            if launches == 1 {
                Err(EngineError::Launch("no executable".to_string()))
            } else {
                Ok(working_browser())
            }
        });

        let pool = pool_with(engine, 1);
        assert!(matches!(
            pool.acquire().await,
            Err(AcquireError::CreationFailed(_))
        ));
        assert_eq!(pool.active_count(), 0);

        // The forfeited slot is usable again.
        let slot = pool.acquire().await.unwrap();
        assert_eq!(pool.active_count(), 1);
        pool.release(slot).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_open_closes_the_browser() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().times(1).returning(|_, _| {
            let mut browser = MockBrowserHandle::new();
            browser
                .expect_new_page()
                .returning(|| Err(EngineError::Protocol("target crashed".to_string())));
            browser.expect_close().times(1).returning(|| Ok(()));
            Ok(Box::new(browser) as Box<dyn BrowserHandle>)
        });

        let pool = pool_with(engine, 1);
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_frees_capacity_even_when_closes_fail() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().returning(|_, _| {
            let mut browser = MockBrowserHandle::new();
            browser.expect_new_page().returning(|| {
                let mut page = MockPageHandle::new();
                page.expect_close()
                    .returning(|| Err(EngineError::Protocol("already gone".to_string())));
                Ok(Box::new(page) as Box<dyn PageHandle>)
            });
            browser
                .expect_close()
                .returning(|| Err(EngineError::Protocol("already gone".to_string())));
            Ok(Box::new(browser) as Box<dyn BrowserHandle>)
        });

        let pool = pool_with(engine, 1);
        let slot = pool.acquire().await.unwrap();
        pool.release(slot).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_gives_its_reservation_back() {
        struct StallingEngine;

        #[async_trait::async_trait]
        impl BrowserEngine for StallingEngine {
            async fn launch(
                &self,
                _persona: &OsPersona,
                _options: &LaunchOptions,
            ) -> Result<Box<dyn BrowserHandle>, EngineError> {
                futures::future::pending().await
            }

            async fn shutdown(&self) -> Result<(), EngineError> {
                Ok(())
            }
        }

        let config = CrawlerConfig {
            max_browsers: 1,
            ..Default::default()
        };
        let pool = BrowserPool::new(Arc::new(StallingEngine), &config);

        // The caller gives up while the browser is still starting; the
        // dropped acquire future must hand its reserved unit back.
        tokio::select! {
            _ = pool.acquire() => panic!("stalled creation should not produce a slot"),
            _ = sleep(Duration::from_secs(1)) => {}
        }
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn personas_rotate_across_slots() {
        let mut engine = MockBrowserEngine::new();
        engine.expect_launch().returning(|_, _| Ok(working_browser()));

        let pool = pool_with(engine, 3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(a.persona, OsPersona::Windows);
        assert_eq!(b.persona, OsPersona::MacOs);
        assert_eq!(c.persona, OsPersona::Linux);
        pool.release(a).await;
        pool.release(b).await;
        pool.release(c).await;
    }
}
