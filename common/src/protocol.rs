//! JSON types served by the recorder's read-only status API.

use serde::{Deserialize, Serialize};

/// A segment file stored in one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub filename: String,
    pub size: u64,
    /// ISO-8601 modification timestamp.
    pub created: String,
}

/// Filesystem usage and retention settings of one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierUsage {
    pub name: String,
    pub path: String,
    pub free_blocks: u64,
    pub total_blocks: u64,
    pub used_percent: f64,
    pub start_percent: u8,
    pub stop_percent: u8,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cameras: usize,
}
