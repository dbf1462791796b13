use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// Running counters for one crawl. Owned by the orchestrator, serialized
/// into progress snapshots and the end-of-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub started_at: DateTime<Utc>,
    pub processed: usize,
    pub failed: usize,
    pub files_saved: usize,
    pub challenges_encountered: usize,
    pub challenges_solved: usize,
    pub retries: usize,
}

impl RunStatistics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            processed: 0,
            failed: 0,
            files_saved: 0,
            challenges_encountered: 0,
            challenges_solved: 0,
            retries: 0,
        }
    }

    pub fn record_saved(&mut self) {
        self.processed += 1;
        self.files_saved += 1;
    }

    pub fn record_failed(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        (self.files_saved as f64 / self.processed as f64) * 100.0
    }

    pub fn urls_per_minute(&self) -> f64 {
        let elapsed = (Utc::now() - self.started_at).num_seconds();
        if elapsed <= 0 {
            return 0.0;
        }
        self.processed as f64 * 60.0 / elapsed as f64
    }

    pub fn log_summary(&self) {
        info!(
            processed = self.processed,
            saved = self.files_saved,
            failed = self.failed,
            retries = self.retries,
            challenges = format!(
                "{}/{} solved",
                self.challenges_solved, self.challenges_encountered
            ),
            success_rate = format!("{:.1}%", self.success_rate()),
            throughput = format!("{:.1} urls/min", self.urls_per_minute()),
            "Crawl finished"
        );
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}
