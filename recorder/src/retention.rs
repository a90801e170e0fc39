//! Retention engine – keeps one tier between its watermarks.
//!
//! Each tick refreshes filesystem usage.  When free space falls below the
//! start watermark the oldest files are evicted one at a time, re-reading
//! only the usage figures in between, until free space reaches the stop
//! watermark or the tier runs out of files.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{RecorderError, Result};
use crate::mover::{self, Evicted};
use crate::tier::{scan_entries, Eviction, SpaceProbe, Statvfs, StorageEntry, Tier, Usage};

/// Outcome of one retention tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    /// Names of the files processed, oldest first.
    pub evicted: Vec<String>,
    /// Eviction stopped because no files were left.
    pub exhausted: bool,
    pub usage: Usage,
}

pub struct RetentionEngine<P: SpaceProbe = Statvfs> {
    tier: Tier,
    probe: P,
    usage: Usage,
    /// Cached scan, newest first; eviction pops from the back.
    entries: Vec<StorageEntry>,
}

impl RetentionEngine<Statvfs> {
    pub fn new(tier: Tier) -> Self {
        Self::with_probe(tier, Statvfs)
    }
}

impl<P: SpaceProbe> RetentionEngine<P> {
    pub fn with_probe(tier: Tier, probe: P) -> Self {
        Self {
            tier,
            probe,
            usage: Usage::default(),
            entries: Vec::new(),
        }
    }

    pub fn tick(&mut self) -> Result<RetentionReport> {
        self.refresh_usage()?;
        let mut report = RetentionReport::default();

        let trigger = self.tier.watermarks.trigger_free(self.usage.total);
        if self.usage.free < trigger {
            let target = self.tier.watermarks.target_free(self.usage.total);
            info!(
                "[{}] {:.1}% used (free {} < {trigger} blocks), evicting until {target} free",
                self.tier.name,
                self.usage.used_percent(),
                self.usage.free
            );
            let mut rescanned = false;
            while self.usage.free < target {
                if self.entries.is_empty() && !rescanned {
                    self.refresh_entries()?;
                    rescanned = true;
                }
                let Some(entry) = self.entries.pop() else {
                    warn!(
                        "[{}] no files left to evict, {} of {target} blocks free",
                        self.tier.name, self.usage.free
                    );
                    report.exhausted = true;
                    break;
                };
                self.evict(&entry)?;
                report.evicted.push(entry.name);
                self.refresh_usage()?;
            }
            info!(
                "[{}] evicted {} file(s), {:.1}% used",
                self.tier.name,
                report.evicted.len(),
                self.usage.used_percent()
            );
        } else if self.entries.is_empty() {
            self.refresh_entries()?;
        }

        report.usage = self.usage;
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` is set or a fatal error occurs.
    pub fn run(mut self, interval: Duration, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "[{}] retention started for {} ({}% → {}% used)",
            self.tier.name,
            self.tier.path.display(),
            self.tier.watermarks.start_percent,
            self.tier.watermarks.stop_percent
        );
        while !shutdown.load(Ordering::Relaxed) {
            self.tick()?;
            sleep_unless_shutdown(interval, shutdown);
        }
        info!("[{}] retention stopped", self.tier.name);
        Ok(())
    }

    fn refresh_usage(&mut self) -> Result<()> {
        self.usage = self
            .probe
            .usage(&self.tier.path)
            .map_err(|source| RecorderError::Usage {
                path: self.tier.path.clone(),
                source,
            })?;
        Ok(())
    }

    fn refresh_entries(&mut self) -> Result<()> {
        self.entries = scan_entries(&self.tier.path).map_err(|source| RecorderError::Scan {
            path: self.tier.path.clone(),
            source,
        })?;
        debug!("[{}] {} file(s) on disk", self.tier.name, self.entries.len());
        Ok(())
    }

    fn evict(&self, entry: &StorageEntry) -> Result<()> {
        let result = match &self.tier.eviction {
            Eviction::Archive { target } => mover::move_to_archive(&entry.path, target),
            Eviction::Delete => mover::delete(&entry.path),
        };
        match result {
            Ok(Evicted::Missing) => {
                debug!("[{}] {} already gone", self.tier.name, entry.name);
                Ok(())
            }
            Ok(how) => {
                info!("[{}] evicted {} ({how:?})", self.tier.name, entry.name);
                Ok(())
            }
            Err(source) => Err(RecorderError::Evict {
                path: entry.path.clone(),
                source,
            }),
        }
    }
}

/// Sleep for `interval` in short slices so a shutdown is noticed quickly.
fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
