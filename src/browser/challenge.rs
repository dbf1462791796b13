use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::engine::PageHandle;

/// Challenge widget injected by the anti-bot provider
const WIDGET_SELECTOR: &str = "div.cf-turnstile";
/// Hidden input the provider fills with a solution token
const TOKEN_SELECTOR: &str = "input[name=\"cf-turnstile-response\"]";
/// Substrings marking a challenge interstitial URL
const URL_INDICATORS: [&str; 2] = ["challenge", "turnstile"];

/// Hard bound on solution polls
const MAX_POLL_ATTEMPTS: u32 = 15;
const POLL_INTERVAL: Duration = Duration::from_millis(2_000);
const SLOW_POLL_INTERVAL: Duration = Duration::from_millis(3_000);
/// Best-effort settle wait after a confirmed solution
const POST_SOLVE_IDLE: Duration = Duration::from_secs(5);

const VISIBILITY_POLL: Duration = Duration::from_millis(250);

/// Terminal state of a solve run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Solved,
    TimedOut,
    Error,
}

/// Detects and waits out the in-page anti-bot challenge. Bounded in both
/// attempts and wall-clock time; never guarantees a solution.
pub struct ChallengeSolver {
    timeout: Duration,
}

impl ChallengeSolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// One synchronous presence check, no waiting. Detection errors count
    /// as "no challenge present".
    pub async fn detect(&self, page: &dyn PageHandle) -> bool {
        match page.element_count(WIDGET_SELECTOR).await {
            Ok(count) => {
                if count > 0 {
                    info!(instances = count, "Challenge widget detected");
                }
                count > 0
            }
            Err(e) => {
                debug!("Error detecting challenge widget: {}", e);
                false
            }
        }
    }

    /// Wait for the challenge to resolve: first for the widget to become
    /// visible (half the budget), then a bounded number of solution polls.
    pub async fn solve(&self, page: &dyn PageHandle) -> ChallengeOutcome {
        info!(budget = ?self.timeout, "Waiting for challenge solution");

        if !self.await_widget_visible(page).await {
            warn!("Challenge widget never became visible");
            return ChallengeOutcome::TimedOut;
        }

        for attempt in 0..MAX_POLL_ATTEMPTS {
            debug!(
                attempt = attempt + 1,
                max = MAX_POLL_ATTEMPTS,
                "Checking challenge solution"
            );

            match self.check_solved(page).await {
                Ok(Some(signal)) => {
                    info!(signal, "Challenge solved");
                    if let Err(e) = page.wait_for_network_idle(POST_SOLVE_IDLE).await {
                        debug!("Post-solve settle wait failed: {}", e);
                    }
                    return ChallengeOutcome::Solved;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Error while polling challenge: {}", e);
                    return ChallengeOutcome::Error;
                }
            }

            let interval = if attempt > 5 {
                SLOW_POLL_INTERVAL
            } else {
                POLL_INTERVAL
            };
            sleep(interval).await;
        }

        warn!(
            attempts = MAX_POLL_ATTEMPTS,
            "Challenge solution timed out"
        );
        ChallengeOutcome::TimedOut
    }

    /// Bounded wait (half the total budget) for the widget to turn visible
    async fn await_widget_visible(&self, page: &dyn PageHandle) -> bool {
        let deadline = Instant::now() + self.timeout / 2;
        loop {
            match page.is_visible(WIDGET_SELECTOR).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    debug!("Visibility check failed: {}", e);
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(VISIBILITY_POLL).await;
        }
    }

    /// Check the three solved conditions in order; Some(reason) when any holds
    async fn check_solved(
        &self,
        page: &dyn PageHandle,
    ) -> Result<Option<&'static str>, crate::browser::engine::EngineError> {
        let token = page.attribute(TOKEN_SELECTOR, "value").await?;
        if token.map_or(false, |t| !t.is_empty()) {
            return Ok(Some("token"));
        }

        if !page.is_visible(WIDGET_SELECTOR).await? {
            return Ok(Some("widget hidden"));
        }

        let url = page.current_url().await?.to_lowercase();
        if !URL_INDICATORS.iter().any(|i| url.contains(i)) {
            return Ok(Some("redirected"));
        }

        Ok(None)
    }
}
