//! NVR Recorder – records camera streams into rotating segment files and
//! keeps the storage tiers within their watermarks.
//!
//! This binary:
//! 1. Reads configuration from `nvr.conf`
//! 2. Starts one segment scheduler per camera (ffmpeg child processes)
//! 3. Starts one retention engine per storage tier (hot → archive → deleted)
//! 4. Optionally serves a read-only status API over HTTP

mod error;
mod muxer;
mod mover;
mod orchestrator;
mod retention;
mod scheduler;
mod server;
mod task;
mod tier;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::muxer::FfmpegMuxer;
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| nvr_common::config::Config::default_path().to_string());
    let config =
        nvr_common::config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "NVR Recorder starting ({} camera(s), hot={}, archive={})",
        config.cameras.len(),
        config.hot_dir.display(),
        config.archive_dir.display()
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── start status server ──────────────────────────────────────────
    let server_handle = config.status_listen_addr.clone().map(|listen_addr| {
        let tiers = orchestrator::tiers(&config).to_vec();
        let cameras = config.cameras.len();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run(tiers, cameras, &listen_addr, shutdown).await {
                tracing::error!("HTTP server error: {e:#}");
            }
        })
    });

    // ── record until shutdown or a fatal error ───────────────────────
    let muxer = Arc::new(FfmpegMuxer::new(config.ffmpeg_bin.clone()));
    let orchestrator = Orchestrator::new(config, muxer, shutdown.clone());
    let result = tokio::task::spawn_blocking(move || orchestrator.run())
        .await
        .context("Orchestrator thread panicked")?;

    shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    if let Err(e) = &result {
        tracing::error!("Recorder stopped on fatal error: {e:#}");
    } else {
        info!("NVR Recorder stopped");
    }
    result
}
