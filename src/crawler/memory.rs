use std::time::Duration;

use sysinfo::System;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cli::config::CrawlerConfig;

/// Minimum spacing between system-pressure relief pauses
const RELIEF_SPACING: Duration = Duration::from_secs(30);
/// Minimum spacing between routine process-size pauses
const ROUTINE_SPACING: Duration = Duration::from_secs(60);

const ROUTINE_PAUSE: Duration = Duration::from_secs(3);
const RELIEF_PAUSE: Duration = Duration::from_secs(5);
const CRITICAL_PAUSE: Duration = Duration::from_secs(10);

/// What the scheduler should do before taking on more work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Proceed,
    /// Sleep, then continue at the current fan-out
    Pause(Duration),
    /// Sleep and halve the batch fan-out while pressure lasts
    PauseAndShrink(Duration),
}

/// Source of memory readings, separated out so throttling is testable
#[cfg_attr(test, mockall::automock)]
pub trait MemoryProbe: Send {
    /// System-wide memory utilisation, 0.0 to 100.0
    fn system_used_pct(&mut self) -> f32;
    /// Resident set size of this process, in MiB
    fn process_rss_mb(&mut self) -> u64;
}

/// Probe backed by the real system tables
pub struct SysinfoProbe {
    system: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn system_used_pct(&mut self) -> f32 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (self.system.used_memory() as f32 / total as f32) * 100.0
    }

    fn process_rss_mb(&mut self) -> u64 {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                debug!("Cannot resolve own pid: {}", e);
                return 0;
            }
        };
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(|p| p.memory() / (1024 * 1024))
            .unwrap_or(0)
    }
}

/// Advisory memory backpressure. Readings never abort work; they only pace
/// it, and only the system-wide critical level shrinks the fan-out.
pub struct BackpressureController {
    probe: Box<dyn MemoryProbe>,
    high_pct: f32,
    critical_pct: f32,
    rss_threshold_mb: u64,
    last_relief: Option<Instant>,
    last_routine: Option<Instant>,
}

impl BackpressureController {
    pub fn new(probe: Box<dyn MemoryProbe>, config: &CrawlerConfig) -> Self {
        Self {
            probe,
            high_pct: config.high_memory_pct,
            critical_pct: config.critical_memory_pct,
            rss_threshold_mb: config.memory_threshold_mb,
            last_relief: None,
            last_routine: None,
        }
    }

    pub fn before_batch(&mut self) -> Throttle {
        self.check()
    }

    fn check(&mut self) -> Throttle {
        let now = Instant::now();
        let system_pct = self.probe.system_used_pct();

        if system_pct > self.high_pct && self.spacing_elapsed(self.last_relief, RELIEF_SPACING) {
            self.last_relief = Some(now);
            if system_pct > self.critical_pct {
                warn!(system_pct, "Critical memory pressure, shrinking fan-out");
                return Throttle::PauseAndShrink(CRITICAL_PAUSE);
            }
            warn!(system_pct, "High memory pressure, pausing");
            return Throttle::Pause(RELIEF_PAUSE);
        }

        let rss_mb = self.probe.process_rss_mb();
        if rss_mb > self.rss_threshold_mb
            && self.spacing_elapsed(self.last_routine, ROUTINE_SPACING)
        {
            self.last_routine = Some(now);
            debug!(rss_mb, "Process over its memory budget, routine pause");
            return Throttle::Pause(ROUTINE_PAUSE);
        }

        Throttle::Proceed
    }

    fn spacing_elapsed(&self, last: Option<Instant>, spacing: Duration) -> bool {
        last.map_or(true, |t| t.elapsed() >= spacing)
    }
}
