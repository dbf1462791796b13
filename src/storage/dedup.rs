use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

const MOTORCYCLE_PREFIX: &str = "motorcycles-specs";
const CAR_PREFIX: &str = "car-specs";

/// Quarantine file for URLs that match no known layout
const QUARANTINE_FILE: &str = "logs/URL_Pattern_ERROR.txt";

/// Where a crawled page's artifact must land on disk, derived purely from
/// the URL path. None when the URL matches no known site layout.
///
/// Motorcycle pages: /motorcycles-specs/{manufacturer}/{model...}
///   -> {root}/{manufacturer}/{model-joined-with-dashes}.html
/// Car pages: /car-specs/{manufacturer}/{id}/{model}
///   -> {root}/{manufacturer}/{MANUFACTURER}_RAW_HTML/{id}-{model}.html
pub fn expected_artifact_path(url: &str, root: &Path) -> Option<PathBuf> {
    let parsed = Url::parse(url).ok()?;
    let parts: Vec<&str> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match parts.first().copied() {
        Some(MOTORCYCLE_PREFIX) if parts.len() >= 3 => {
            let manufacturer = parts[1];
            let model = parts[2..].join("-");
            Some(root.join(manufacturer).join(format!("{model}.html")))
        }
        Some(CAR_PREFIX) if parts.len() >= 4 => {
            let manufacturer = parts[1];
            let id = parts[2];
            let model = parts[3];
            Some(
                root.join(manufacturer)
                    .join(format!("{}_RAW_HTML", manufacturer.to_uppercase()))
                    .join(format!("{id}-{model}.html")),
            )
        }
        _ => None,
    }
}

/// Outcome of a dedup pass over the input list
#[derive(Debug, Default, Serialize)]
pub struct FilterStats {
    pub total: usize,
    pub already_crawled: usize,
    pub unrecognized: usize,
    pub to_process: usize,
}

/// Filters the input URL list against artifacts already on disk, so a
/// rerun over the same list only crawls what is missing.
pub struct Deduplicator {
    root: PathBuf,
    existing: HashSet<PathBuf>,
}

impl Deduplicator {
    /// Scan the output tree once up front. The walk tolerates a missing
    /// root; a first run simply sees an empty set.
    pub fn new(root: &Path) -> Self {
        let mut existing = HashSet::new();
        if root.exists() {
            for entry in jwalk::WalkDir::new(root).into_iter().flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == "html") {
                    existing.insert(path);
                }
            }
        }
        info!(
            artifacts = existing.len(),
            root = %root.display(),
            "Scanned output tree"
        );
        Self {
            root: root.to_path_buf(),
            existing,
        }
    }

    /// Expected artifact path for one URL, against this index's root
    pub fn artifact_path(&self, url: &str) -> Option<PathBuf> {
        expected_artifact_path(url, &self.root)
    }

    /// Split the input into URLs still needing a crawl. Unrecognized URLs
    /// fail open: they stay in the work list and are quarantined for
    /// inspection. With `force` set, existing artifacts are recrawled.
    pub fn filter(&self, urls: Vec<String>, force: bool) -> (Vec<String>, FilterStats) {
        let mut stats = FilterStats {
            total: urls.len(),
            ..Default::default()
        };
        let mut to_process = Vec::new();

        for url in urls {
            match self.artifact_path(&url) {
                Some(path) => {
                    let exists = self.existing.contains(&path) || path.exists();
                    if exists && !force {
                        debug!(url, "Artifact already on disk, skipping");
                        stats.already_crawled += 1;
                    } else {
                        to_process.push(url);
                    }
                }
                None => {
                    stats.unrecognized += 1;
                    if let Err(e) = quarantine(&url) {
                        warn!(url, "Could not quarantine unrecognized URL: {}", e);
                    }
                    to_process.push(url);
                }
            }
        }

        stats.to_process = to_process.len();
        info!(
            total = stats.total,
            skipped = stats.already_crawled,
            unrecognized = stats.unrecognized,
            remaining = stats.to_process,
            "URL list filtered against existing artifacts"
        );
        (to_process, stats)
    }
}

/// Append a URL that matched no known layout to the quarantine file
fn quarantine(url: &str) -> Result<()> {
    if let Some(parent) = Path::new(QUARANTINE_FILE).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(QUARANTINE_FILE)
        .with_context(|| format!("Failed to open {}", QUARANTINE_FILE))?;
    writeln!(file, "{}", url).context("Failed to append quarantined URL")?;
    Ok(())
}
