//! Configuration parsing – reads a `KEY=VALUE` file such as `nvr.conf`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::camera::CameraDef;

/// Capacity watermarks of one storage tier, as *used* percentages.
///
/// Eviction starts once usage exceeds `start_percent` and continues until
/// usage is back at or below `stop_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub start_percent: u8,
    pub stop_percent: u8,
}

impl Watermarks {
    pub fn new(start_percent: u8, stop_percent: u8) -> Self {
        Self {
            start_percent: start_percent.min(100),
            stop_percent: stop_percent.min(100),
        }
    }

    /// Free blocks below which eviction starts.
    pub fn trigger_free(&self, total: u64) -> u64 {
        percent_of(total, 100u64.saturating_sub(self.start_percent as u64))
    }

    /// Free blocks eviction must reach before it stops.
    pub fn target_free(&self, total: u64) -> u64 {
        percent_of(total, 100u64.saturating_sub(self.stop_percent as u64))
    }
}

fn percent_of(total: u64, percent: u64) -> u64 {
    (total as u128 * percent as u128 / 100) as u64
}

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── cameras ──────────────────────────────────────────────────────
    pub cameras: Vec<CameraDef>,

    // ── storage tiers ────────────────────────────────────────────────
    pub hot_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub hot_watermarks: Watermarks,
    pub archive_watermarks: Watermarks,

    // ── loop cadence ─────────────────────────────────────────────────
    pub scheduler_interval: Duration,
    pub retention_interval: Duration,
    /// How long a cancelled previous segment may take to exit.
    pub cancel_grace: Duration,

    // ── muxer ────────────────────────────────────────────────────────
    pub ffmpeg_bin: String,

    // ── status API ───────────────────────────────────────────────────
    /// Address of the read-only status server; disabled when `None`.
    pub status_listen_addr: Option<String>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/nvr/nvr.conf"
    }
}

/// Read and parse a `KEY=VALUE` configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;
    let config = from_str(&text)?;
    info!(
        "Loaded config from {} ({} camera(s))",
        path.display(),
        config.cameras.len()
    );
    Ok(config)
}

/// Build a [`Config`] from the text of a configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn from_str(text: &str) -> Result<Config> {
    let map = parse_conf(text);

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_percent = |key: &str, default: u8| -> u8 {
        get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.min(100) as u8)
            .unwrap_or(default)
    };

    let cameras = get("CAMERAS")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(CameraDef::parse)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()
        .context("Invalid camera definition in CAMERAS")?
        .unwrap_or_default();
    if cameras.is_empty() {
        anyhow::bail!("No cameras configured (set CAMERAS=name:pattern:url,...)");
    }

    let hot_watermarks = Watermarks::new(
        get_percent("HOT_START_PERCENT", 90),
        get_percent("HOT_STOP_PERCENT", 80),
    );
    let archive_watermarks = Watermarks::new(
        get_percent("ARCHIVE_START_PERCENT", 95),
        get_percent("ARCHIVE_STOP_PERCENT", 90),
    );
    for (tier, marks) in [("hot", hot_watermarks), ("archive", archive_watermarks)] {
        if marks.stop_percent >= marks.start_percent {
            warn!(
                "{tier} tier stop watermark {}% is not below start watermark {}% – \
                 eviction will stop as soon as the trigger clears",
                marks.stop_percent, marks.start_percent
            );
        }
    }

    Ok(Config {
        cameras,
        hot_dir: PathBuf::from(get("HOT_DIR").unwrap_or_else(|| "/data/hot".into())),
        archive_dir: PathBuf::from(
            get("ARCHIVE_DIR").unwrap_or_else(|| "/data/archived".into()),
        ),
        hot_watermarks,
        archive_watermarks,
        scheduler_interval: Duration::from_millis(get_u64("SCHEDULER_INTERVAL_MS", 500).max(10)),
        retention_interval: Duration::from_secs(get_u64("RETENTION_INTERVAL_SECS", 10).max(1)),
        cancel_grace: Duration::from_millis(get_u64("CANCEL_GRACE_MS", 3000)),
        ffmpeg_bin: get("FFMPEG_BIN")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "ffmpeg".into()),
        status_listen_addr: get("STATUS_LISTEN_ADDR").filter(|s| !s.is_empty()),
    })
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
