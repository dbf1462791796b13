use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};
use url::Url;

/// Result of cleaning an input URL list
#[derive(Debug, Default)]
pub struct UrlReport {
    pub valid: Vec<String>,
    pub invalid_scheme: usize,
    pub malformed: usize,
    pub duplicates: usize,
}

/// Read a URL list file: one URL per line, blank lines and `#` comments
/// ignored
pub fn load_url_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL file: {}", path.display()))?;

    let urls: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    info!(count = urls.len(), file = %path.display(), "Loaded URL list");
    Ok(urls)
}

/// Drop malformed and non-http(s) URLs and collapse duplicates, keeping
/// first-seen order
pub fn validate_and_deduplicate(urls: Vec<String>) -> UrlReport {
    let mut report = UrlReport::default();
    let mut seen = HashSet::new();

    for url in urls {
        match Url::parse(&url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                if seen.insert(url.clone()) {
                    report.valid.push(url);
                } else {
                    report.duplicates += 1;
                }
            }
            Ok(parsed) => {
                warn!(url, scheme = parsed.scheme(), "Skipping non-http URL");
                report.invalid_scheme += 1;
            }
            Err(e) => {
                warn!(url, "Skipping malformed URL: {}", e);
                report.malformed += 1;
            }
        }
    }

    if report.invalid_scheme + report.malformed + report.duplicates > 0 {
        info!(
            valid = report.valid.len(),
            invalid_scheme = report.invalid_scheme,
            malformed = report.malformed,
            duplicates = report.duplicates,
            "URL list cleaned"
        );
    }
    report
}
