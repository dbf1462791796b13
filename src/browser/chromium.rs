use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
    ContinueWithAuthParams, EnableParams as FetchEnableParams, EventAuthRequired,
    EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams as NetworkEnableParams, ErrorReason, EventResponseReceived, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::browser::engine::{
    BrowserEngine, BrowserHandle, EngineError, LaunchOptions, NavigationResult, PageHandle,
    RequestInfo, RequestPolicy, ResourceKind, RouteDecision,
};
use crate::browser::persona::OsPersona;
use crate::proxy::ProxyCredentials;

/// How long to wait for the main document's response event after navigation
const STATUS_SETTLE: Duration = Duration::from_millis(500);
const STATUS_POLL: Duration = Duration::from_millis(50);
const READY_STATE_POLL: Duration = Duration::from_millis(100);
const SELECTOR_POLL: Duration = Duration::from_millis(100);

impl From<CdpError> for EngineError {
    fn from(e: CdpError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

fn map_resource_type(t: &ResourceType) -> ResourceKind {
    match t {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Stylesheet => ResourceKind::Stylesheet,
        ResourceType::Image => ResourceKind::Image,
        ResourceType::Media => ResourceKind::Media,
        ResourceType::Font => ResourceKind::Font,
        ResourceType::Script => ResourceKind::Script,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        ResourceType::WebSocket => ResourceKind::Websocket,
        _ => ResourceKind::Other,
    }
}

/// Embed a string as a JavaScript string literal
fn js_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Engine backed by a real Chromium process driven over CDP
pub struct ChromiumEngine;

impl ChromiumEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ChromiumEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn launch(
        &self,
        persona: &OsPersona,
        options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserHandle>, EngineError> {
        let viewport = persona.viewport();

        let mut builder = BrowserConfigBuilder::default()
            .request_timeout(Duration::from_secs(30))
            .window_size(viewport.width, viewport.height)
            .arg(format!("--user-agent={}", persona.user_agent()))
            .arg(format!("--lang={}", options.locale))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-background-networking")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-breakpad")
            .arg("--disable-hang-monitor")
            .arg("--disable-ipc-flooding-protection")
            .arg("--disable-prompt-on-repost")
            .arg("--metrics-recording-only")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--password-store=basic")
            .arg("--use-mock-keychain")
            .arg("--hide-scrollbars")
            .arg("--mute-audio");

        if options.headless {
            builder = builder.headless_mode(HeadlessMode::default());
        } else {
            builder = builder.with_head();
        }

        // CHROMIUM_PATH overrides chromiumoxide's own executable detection
        if let Ok(path) = std::env::var("CHROMIUM_PATH") {
            builder = builder.chrome_executable(PathBuf::from(path));
        }

        if let Some(proxy) = &options.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server));
        }
        if options.block_webrtc {
            builder = builder.arg("--force-webrtc-ip-handling-policy=disable_non_proxied_udp");
        }

        let config = builder
            .build()
            .map_err(|e| EngineError::Launch(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;

        // Drive the CDP connection. Chrome sends events chromiumoxide cannot
        // deserialize; those are known-benign and must not spam the log.
        let handler_task = tokio::spawn(async move {
            while let Some(result) = handler.next().await {
                if let Err(e) = result {
                    let msg = e.to_string();
                    let benign = msg
                        .contains("data did not match any variant of untagged enum Message")
                        || msg.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("Suppressed benign CDP serialization error: {}", msg);
                    } else {
                        error!("Browser handler error: {:?}", e);
                    }
                }
            }
            debug!("Browser handler task finished");
        });

        info!(persona = persona.name(), "Chromium instance launched");
        Ok(Box::new(ChromiumBrowser {
            browser,
            handler_task,
            persona: *persona,
            humanize: options.humanize,
            geoip: options.geoip,
            proxy: options.proxy.clone(),
        }))
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        // Browser processes are owned per-handle; nothing global to stop.
        Ok(())
    }
}

pub struct ChromiumBrowser {
    browser: Browser,
    handler_task: JoinHandle<()>,
    persona: OsPersona,
    humanize: bool,
    geoip: bool,
    proxy: Option<ProxyCredentials>,
}

impl ChromiumBrowser {
    fn stealth_script(&self) -> String {
        format!(
            r#"
            Object.defineProperty(navigator, 'webdriver', {{ get: () => false }});
            Object.defineProperty(navigator, 'platform', {{ get: () => {platform} }});
            Object.defineProperty(navigator, 'languages', {{ get: () => ['en-US', 'en'] }});
            if (!window.chrome) {{ window.chrome = {{ runtime: {{}} }}; }}
            "#,
            platform = js_literal(self.persona.platform()),
        )
    }

    /// Pin geolocation to a stable, slightly jittered point instead of
    /// letting the site see a denied permission prompt
    fn geoip_script(&self) -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let latitude = 40.4168 + rng.gen_range(-0.05..0.05);
        let longitude = -3.7038 + rng.gen_range(-0.05..0.05);
        format!(
            r#"
            const __pos = {{
                coords: {{ latitude: {latitude:.4}, longitude: {longitude:.4}, accuracy: 50 }},
                timestamp: Date.now(),
            }};
            navigator.geolocation.getCurrentPosition = (ok) => ok(__pos);
            navigator.geolocation.watchPosition = (ok) => {{ ok(__pos); return 0; }};
            "#
        )
    }
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_page(&mut self) -> Result<Box<dyn PageHandle>, EngineError> {
        let page = self.browser.new_page("about:blank").await?;

        if self.humanize {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
                self.stealth_script(),
            ))
            .await?;
        }
        if self.geoip {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
                self.geoip_script(),
            ))
            .await?;
        }

        ChromiumPage::attach(page, self.proxy.clone())
            .await
            .map(|p| Box::new(p) as Box<dyn PageHandle>)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let result = self.browser.close().await;
        if let Err(e) = self.browser.wait().await {
            debug!("Browser process wait failed: {}", e);
        }
        self.handler_task.abort();
        result.map(|_| ()).map_err(EngineError::from)
    }
}

pub struct ChromiumPage {
    page: Page,
    /// Last observed main-document response status for this page
    last_status: Arc<StdMutex<Option<u16>>>,
    tasks: Vec<JoinHandle<()>>,
    proxy: Option<ProxyCredentials>,
}

impl ChromiumPage {
    async fn attach(page: Page, proxy: Option<ProxyCredentials>) -> Result<Self, EngineError> {
        page.execute(NetworkEnableParams::default()).await?;

        let last_status = Arc::new(StdMutex::new(None));
        let status_slot = Arc::clone(&last_status);
        let mut responses = page.event_listener::<EventResponseReceived>().await?;
        let status_task = tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if event.r#type == ResourceType::Document {
                    let status = u16::try_from(event.response.status).ok();
                    if let Ok(mut slot) = status_slot.lock() {
                        *slot = status;
                    }
                }
            }
        });

        Ok(Self {
            page,
            last_status,
            tasks: vec![status_task],
            proxy,
        })
    }

    async fn eval<T: serde::de::DeserializeOwned>(&self, expr: String) -> Result<T, EngineError> {
        let result = self.page.evaluate(expr).await?;
        result
            .into_value::<T>()
            .map_err(|e| EngineError::Protocol(format!("evaluation result: {e}")))
    }
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn set_request_policy(
        &mut self,
        policy: Arc<dyn RequestPolicy>,
    ) -> Result<(), EngineError> {
        let mut enable = FetchEnableParams::default();
        enable.handle_auth_requests = Some(self.proxy.is_some());
        self.page.execute(enable).await?;

        let mut paused = self.page.event_listener::<EventRequestPaused>().await?;
        let page = self.page.clone();
        let route_task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let info = RequestInfo {
                    url: event.request.url.clone(),
                    resource_kind: map_resource_type(&event.resource_type),
                    is_navigation: event.resource_type == ResourceType::Document,
                };
                let command_result = match policy.decide(&info) {
                    RouteDecision::Allow => page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ()),
                    RouteDecision::Abort => page
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::BlockedByClient,
                        ))
                        .await
                        .map(|_| ()),
                };
                if let Err(e) = command_result {
                    // The request may already be gone by the time we answer.
                    trace!(url = %info.url, "Interception reply failed: {}", e);
                }
            }
        });
        self.tasks.push(route_task);

        if let Some(creds) = self.proxy.clone() {
            let mut auth_events = self.page.event_listener::<EventAuthRequired>().await?;
            let page = self.page.clone();
            let auth_task = tokio::spawn(async move {
                while let Some(event) = auth_events.next().await {
                    let response = AuthChallengeResponse {
                        response: AuthChallengeResponseResponse::ProvideCredentials,
                        username: creds.username.clone(),
                        password: creds.password.clone(),
                    };
                    if let Err(e) = page
                        .execute(ContinueWithAuthParams::new(
                            event.request_id.clone(),
                            response,
                        ))
                        .await
                    {
                        warn!("Proxy auth reply failed: {}", e);
                    }
                }
            });
            self.tasks.push(auth_task);
        }

        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        limit: Duration,
    ) -> Result<NavigationResult, EngineError> {
        if let Ok(mut slot) = self.last_status.lock() {
            *slot = None;
        }

        match timeout(limit, self.page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(EngineError::Protocol(e.to_string())),
            Err(_) => return Err(EngineError::Timeout(limit)),
        }

        // The response event races the load event; give it a moment.
        let deadline = Instant::now() + STATUS_SETTLE;
        loop {
            let observed = self.last_status.lock().ok().and_then(|slot| *slot);
            if observed.is_some() || Instant::now() >= deadline {
                return Ok(NavigationResult { status: observed });
            }
            sleep(STATUS_POLL).await;
        }
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        limit: Duration,
    ) -> Result<bool, EngineError> {
        let deadline = Instant::now() + limit;
        loop {
            if self.element_count(selector).await? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(SELECTOR_POLL).await;
        }
    }

    async fn element_count(&self, selector: &str) -> Result<usize, EngineError> {
        self.eval(format!(
            "document.querySelectorAll({}).length",
            js_literal(selector)
        ))
        .await
    }

    async fn is_visible(&self, selector: &str) -> Result<bool, EngineError> {
        self.eval(format!(
            r#"(() => {{
                const el = document.querySelector({});
                if (!el) return false;
                const style = window.getComputedStyle(el);
                if (style.display === 'none' || style.visibility === 'hidden') return false;
                const rect = el.getBoundingClientRect();
                return rect.width > 0 && rect.height > 0;
            }})()"#,
            js_literal(selector)
        ))
        .await
    }

    async fn attribute(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, EngineError> {
        // Live DOM property first: scripts fill `value` without touching
        // the markup attribute.
        self.eval(format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return null;
                const prop = el[{attr}];
                if (typeof prop === 'string') return prop;
                return el.getAttribute({attr});
            }})()"#,
            sel = js_literal(selector),
            attr = js_literal(name)
        ))
        .await
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        let url = self.page.url().await?;
        Ok(url.unwrap_or_default())
    }

    async fn wait_for_network_idle(&self, limit: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + limit;
        loop {
            let ready: String = self
                .eval("document.readyState".to_string())
                .await
                .unwrap_or_default();
            if ready == "complete" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!("Page did not settle within {:?}", limit);
                return Ok(());
            }
            sleep(READY_STATE_POLL).await;
        }
    }

    async fn content(&self) -> Result<String, EngineError> {
        self.page.content().await.map_err(EngineError::from)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.page.clone().close().await.map_err(EngineError::from)
    }
}
