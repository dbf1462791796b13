use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::browser::engine::{EngineError, PageHandle, RequestInfo, RequestPolicy, RouteDecision};
use crate::cli::config::CrawlerConfig;

/// Per-page request interception policy. Decides allow/abort for each
/// outgoing request from resource type and URL patterns, with the challenge
/// provider always allowed through.
pub struct ResourceBlocker {
    block_resources: Vec<String>,
    block_patterns: Vec<String>,
    allow_patterns: Vec<String>,
    challenge_hosts: Vec<String>,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl ResourceBlocker {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            block_resources: config.block_resources.clone(),
            block_patterns: config
                .block_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            allow_patterns: config.allow_patterns.clone(),
            challenge_hosts: config.challenge_hosts.clone(),
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Install this policy on a page
    pub async fn attach(
        self: &Arc<Self>,
        page: &mut dyn PageHandle,
    ) -> Result<(), EngineError> {
        page.set_request_policy(Arc::clone(self) as Arc<dyn RequestPolicy>)
            .await
    }

    /// Requests allowed through so far on this page
    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Requests aborted so far on this page
    pub fn blocked_count(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }
}

impl RequestPolicy for ResourceBlocker {
    fn decide(&self, request: &RequestInfo) -> RouteDecision {
        let url = &request.url;
        let url_lower = url.to_lowercase();

        // Challenge provider and explicit allow patterns take precedence
        // over everything else.
        if self.challenge_hosts.iter().any(|h| url_lower.contains(h))
            || self.allow_patterns.iter().any(|p| url.contains(p))
        {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return RouteDecision::Allow;
        }

        // The navigation's primary document request is never aborted,
        // whatever its URL looks like.
        if request.is_navigation {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return RouteDecision::Allow;
        }

        let kind = request.resource_kind.as_str();
        if self.block_resources.iter().any(|r| r == kind)
            || self.block_patterns.iter().any(|p| url_lower.contains(p))
        {
            trace!(url, kind, "aborting request");
            self.blocked.fetch_add(1, Ordering::Relaxed);
            return RouteDecision::Abort;
        }

        self.allowed.fetch_add(1, Ordering::Relaxed);
        RouteDecision::Allow
    }
}
