use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::pool::AcquireError;

/// Why a single crawl attempt failed. The variant decides whether the
/// scheduler retries the URL or records it as permanently failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("browser pool exhausted")]
    ResourceExhausted(#[source] AcquireError),

    #[error("browser creation failed")]
    BrowserCreationFailed(#[source] AcquireError),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("challenge not solved: {0}")]
    ChallengeFailed(String),

    #[error("required element missing: {0}")]
    ElementMissing(String),

    #[error("extracted data failed validation: {0}")]
    ValidationFailed(String),

    #[error("saving artifact failed: {0}")]
    SaveFailed(String),

    #[error("unexpected failure: {0}")]
    Unexpected(String),

    #[error("crawl cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Transient failures are worth another attempt with a fresh browser.
    /// Missing page structure and validation failures are page properties,
    /// not flakes, and retrying them wastes the whole retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AttemptError::ResourceExhausted(_)
                | AttemptError::BrowserCreationFailed(_)
                | AttemptError::NavigationFailed(_)
                | AttemptError::ChallengeFailed(_)
                | AttemptError::Unexpected(_)
        )
    }

    /// Stable category name used in the failure log
    pub fn category(&self) -> &'static str {
        match self {
            AttemptError::ResourceExhausted(_) => "resource_exhausted",
            AttemptError::BrowserCreationFailed(_) => "browser_creation_failed",
            AttemptError::NavigationFailed(_) => "navigation_failed",
            AttemptError::ChallengeFailed(_) => "challenge_failed",
            AttemptError::ElementMissing(_) => "element_missing",
            AttemptError::ValidationFailed(_) => "validation_failed",
            AttemptError::SaveFailed(_) => "save_failed",
            AttemptError::Unexpected(_) => "unexpected",
            AttemptError::Cancelled => "cancelled",
        }
    }
}

impl From<AcquireError> for AttemptError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Exhausted(_) => AttemptError::ResourceExhausted(e),
            AcquireError::CreationFailed(_) => AttemptError::BrowserCreationFailed(e),
        }
    }
}

/// Result of a fully processed URL, after retries
#[derive(Debug)]
pub enum CrawlOutcome {
    /// Page crawled and its artifact written to disk
    Saved { path: std::path::PathBuf },
    /// All attempts failed; the final error is recorded
    Failed { error: AttemptError, attempts: u32 },
    /// The run was cancelled before this URL completed
    Cancelled,
}

/// Entry appended to the persistent failure log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub url: String,
    pub reason: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(url: &str, error: &AttemptError) -> Self {
        Self {
            url: url.to_string(),
            reason: error.category().to_string(),
            details: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}
