use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::proxy::ProxyCredentials;

/// A single clamp applied during validation, returned to the caller so it can
/// be surfaced instead of silently mutating state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub field: &'static str,
    pub applied: String,
}

/// Immutable configuration snapshot for one crawl run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Upper bound on concurrently live browser instances
    pub max_browsers: usize,
    pub headless: bool,

    /// Persona realism flags
    pub humanize: bool,
    pub geoip: bool,
    pub block_webrtc: bool,

    /// Per-stage timeouts, milliseconds
    pub navigation_timeout_ms: u64,
    pub element_timeout_ms: u64,
    pub challenge_timeout_ms: u64,
    pub network_idle_timeout_ms: u64,
    pub stability_wait_ms: u64,
    pub post_challenge_wait_ms: u64,

    /// Request interception policy
    pub block_resources: Vec<String>,
    pub block_patterns: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub challenge_hosts: Vec<String>,

    pub proxy: Option<ProxyCredentials>,

    /// Scheduling
    pub batch_size: usize,
    pub url_delay_ms: u64,
    pub max_retries: u32,
    pub max_total_urls: usize,

    /// Backpressure
    pub memory_threshold_mb: u64,
    pub high_memory_pct: f32,
    pub critical_memory_pct: f32,

    /// Validation and persistence policy
    pub min_content_length: usize,
    pub save_partial_data: bool,
    pub aggressive_wait_mode: bool,
    pub output_dir: PathBuf,

    /// Page signals that must be present before extraction
    pub required_selectors: Vec<String>,
    pub optional_selectors: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_browsers: 5,
            headless: true,
            humanize: true,
            geoip: true,
            block_webrtc: false,
            navigation_timeout_ms: 60_000,
            element_timeout_ms: 10_000,
            challenge_timeout_ms: 20_000,
            network_idle_timeout_ms: 3_000,
            stability_wait_ms: 2_000,
            post_challenge_wait_ms: 4_000,
            block_resources: ["stylesheet", "image", "media", "font", "other"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            block_patterns: [
                ".css", ".webp", ".jpg", ".jpeg", ".png", ".svg", ".gif", ".woff", ".woff2",
                ".php", ".pdf", ".zip",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allow_patterns: vec!["/cargallery/".to_string()],
            challenge_hosts: vec![
                "challenges.cloudflare.com".to_string(),
                "turnstile".to_string(),
            ],
            proxy: None,
            batch_size: 20,
            url_delay_ms: 1_000,
            max_retries: 3,
            max_total_urls: 50_000,
            memory_threshold_mb: 49_152,
            high_memory_pct: 75.0,
            critical_memory_pct: 85.0,
            min_content_length: 50,
            save_partial_data: false,
            aggressive_wait_mode: false,
            output_dir: PathBuf::from("output"),
            required_selectors: vec![
                "h3.posts_title".to_string(),
                "div.ficha_specs_main".to_string(),
            ],
            optional_selectors: vec![
                "script[type=\"application/ld+json\"]".to_string(),
                "div#car_image img".to_string(),
            ],
        }
    }
}

impl CrawlerConfig {
    /// Clamp out-of-range fields to their valid domains. Invalid values are
    /// corrected, never rejected; each applied correction is reported back.
    pub fn validated(mut self) -> (Self, Vec<Correction>) {
        let mut corrections = Vec::new();

        if !(1..=20).contains(&self.max_browsers) {
            self.max_browsers = self.max_browsers.clamp(1, 20);
            corrections.push(Correction {
                field: "max_browsers",
                applied: format!("clamped to {}", self.max_browsers),
            });
        }
        if !(1..=100).contains(&self.batch_size) {
            self.batch_size = self.batch_size.clamp(1, 100);
            corrections.push(Correction {
                field: "batch_size",
                applied: format!("clamped to {}", self.batch_size),
            });
        }
        if !(1_000..=65_536).contains(&self.memory_threshold_mb) {
            self.memory_threshold_mb = self.memory_threshold_mb.clamp(1_000, 65_536);
            corrections.push(Correction {
                field: "memory_threshold_mb",
                applied: format!("clamped to {}", self.memory_threshold_mb),
            });
        }
        if self.navigation_timeout_ms == 0 {
            self.navigation_timeout_ms = 60_000;
            corrections.push(Correction {
                field: "navigation_timeout_ms",
                applied: "reset to 60000".to_string(),
            });
        }
        if self.element_timeout_ms == 0 {
            self.element_timeout_ms = 10_000;
            corrections.push(Correction {
                field: "element_timeout_ms",
                applied: "reset to 10000".to_string(),
            });
        }
        if self.challenge_timeout_ms == 0 {
            self.challenge_timeout_ms = 20_000;
            corrections.push(Correction {
                field: "challenge_timeout_ms",
                applied: "reset to 20000".to_string(),
            });
        }
        if self.min_content_length == 0 {
            self.min_content_length = 50;
            corrections.push(Correction {
                field: "min_content_length",
                applied: "reset to 50".to_string(),
            });
        }
        if self.max_retries == 0 {
            self.max_retries = 1;
            corrections.push(Correction {
                field: "max_retries",
                applied: "reset to 1".to_string(),
            });
        }
        if !(50.0..=99.0).contains(&self.high_memory_pct) {
            self.high_memory_pct = self.high_memory_pct.clamp(50.0, 99.0);
            corrections.push(Correction {
                field: "high_memory_pct",
                applied: format!("clamped to {}", self.high_memory_pct),
            });
        }
        if self.critical_memory_pct < self.high_memory_pct {
            self.critical_memory_pct = self.high_memory_pct;
            corrections.push(Correction {
                field: "critical_memory_pct",
                applied: format!("raised to {}", self.critical_memory_pct),
            });
        }

        (self, corrections)
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "ghostcrawler", "ghostcrawler")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Load a named configuration profile, or the defaults when none exists
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            info!("Profile '{}' not found, using defaults", profile);
            Ok(Self::default())
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }
}
