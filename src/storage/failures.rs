use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::crawler::task::FailureRecord;

/// How many pending URLs a progress snapshot carries, at most
const SNAPSHOT_SAMPLE_LIMIT: usize = 100;

/// Persistent failure journal. The file always holds one valid JSON array,
/// rewritten whole on every append so a crash mid-run never leaves a
/// half-written record behind.
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub async fn record(&self, record: FailureRecord) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut records = self.read_existing().await;
        records.push(record);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents =
            serde_json::to_string_pretty(&records).context("Failed to serialize failure log")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        Ok(())
    }

    /// A missing or corrupt log starts over empty; failures to read the
    /// journal must never fail the crawl itself.
    async fn read_existing(&self) -> Vec<FailureRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(records) => records,
                Err(e) => {
                    warn!(path = %self.path.display(), "Corrupt failure log, starting over: {}", e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }
}

/// Point-in-time view of a running crawl, written between batches so an
/// operator can inspect a long run without attaching to it
#[derive(Debug, Serialize)]
struct ProgressSnapshot<'a, S: Serialize> {
    timestamp: DateTime<Utc>,
    stats: &'a S,
    remaining_count: usize,
    remaining_sample: &'a [String],
}

pub async fn write_progress_snapshot<S: Serialize>(
    path: &Path,
    stats: &S,
    remaining: &[String],
) -> Result<()> {
    let sample_len = remaining.len().min(SNAPSHOT_SAMPLE_LIMIT);
    let snapshot = ProgressSnapshot {
        timestamp: Utc::now(),
        stats,
        remaining_count: remaining.len(),
        remaining_sample: &remaining[..sample_len],
    };

    let contents =
        serde_json::to_string_pretty(&snapshot).context("Failed to serialize progress snapshot")?;
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
