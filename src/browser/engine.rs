use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::browser::persona::OsPersona;
use crate::proxy::ProxyCredentials;

/// Errors surfaced by the browser-driving engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Coarse resource classification of an outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    Websocket,
    Other,
}

impl ResourceKind {
    /// Name used in configuration block lists
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Document => "document",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Image => "image",
            ResourceKind::Media => "media",
            ResourceKind::Font => "font",
            ResourceKind::Script => "script",
            ResourceKind::Xhr => "xhr",
            ResourceKind::Fetch => "fetch",
            ResourceKind::Websocket => "websocket",
            ResourceKind::Other => "other",
        }
    }
}

/// One outgoing network request, as seen by the interception hook
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub url: String,
    pub resource_kind: ResourceKind,
    /// True for the navigation's primary document request
    pub is_navigation: bool,
}

/// Decision returned by a request policy for each outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Abort,
}

/// Synchronous per-request allow/abort policy installed on a page
pub trait RequestPolicy: Send + Sync {
    fn decide(&self, request: &RequestInfo) -> RouteDecision;
}

/// Options applied when launching a fresh browser instance
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub humanize: bool,
    pub geoip: bool,
    pub block_webrtc: bool,
    pub locale: String,
    pub proxy: Option<ProxyCredentials>,
}

/// Outcome of a navigation; `status` is absent when the engine could not
/// observe the main document response
#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub status: Option<u16>,
}

impl NavigationResult {
    /// A navigation counts as successful only with an observed 2xx/3xx status
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(s) if s < 400)
    }
}

/// Engine that can launch fresh browser instances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(
        &self,
        persona: &OsPersona,
        options: &LaunchOptions,
    ) -> Result<Box<dyn BrowserHandle>, EngineError>;

    /// Stop the underlying driving engine
    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Handle to one live browser instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_page(&mut self) -> Result<Box<dyn PageHandle>, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}

/// Handle to a single page within a browser instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Install a per-request allow/abort policy, invoked once per outgoing request
    async fn set_request_policy(
        &mut self,
        policy: Arc<dyn RequestPolicy>,
    ) -> Result<(), EngineError>;

    async fn navigate(&self, url: &str, timeout: Duration)
        -> Result<NavigationResult, EngineError>;

    /// Wait until at least one element matches `selector`; false on timeout
    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, EngineError>;

    async fn element_count(&self, selector: &str) -> Result<usize, EngineError>;

    async fn is_visible(&self, selector: &str) -> Result<bool, EngineError>;

    /// Attribute of the first element matching `selector`, if the element exists
    async fn attribute(&self, selector: &str, name: &str)
        -> Result<Option<String>, EngineError>;

    async fn current_url(&self) -> Result<String, EngineError>;

    /// Best-effort wait until the page stops loading; Ok even when it never settles
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Full serialized page source
    async fn content(&self) -> Result<String, EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}
