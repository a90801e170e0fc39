//! Read-only HTTP status API.
//!
//! Routes:
//!   GET  /api/health                          → health check
//!   GET  /api/tiers                           → usage of every tier
//!   GET  /api/tiers/{tier}/recordings         → settled segments in a tier
//!   GET  /api/tiers/{tier}/recordings/{name}  → download a segment

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::info;

use nvr_common::protocol::{HealthResponse, RecordingInfo, TierUsage};

use crate::scheduler::SEGMENT_EXTENSION;
use crate::tier::{modified_secs, SpaceProbe, Statvfs, Tier};

/// Segments modified more recently than this are still being written.
const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    tiers: Arc<Vec<Tier>>,
    cameras: usize,
    start_time: Instant,
}

impl AppState {
    fn tier(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tiers", get(list_tiers))
        .route("/api/tiers/{tier}/recordings", get(list_recordings))
        .route("/api/tiers/{tier}/recordings/{name}", get(download_recording))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    tiers: Vec<Tier>,
    cameras: usize,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let state = AppState {
        tiers: Arc::new(tiers),
        cameras,
        start_time: Instant::now(),
    };

    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status HTTP server listening on {listen_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cameras: state.cameras,
    })
}

async fn list_tiers(State(state): State<AppState>) -> Result<Json<Vec<TierUsage>>, StatusCode> {
    let mut tiers = Vec::with_capacity(state.tiers.len());
    for tier in state.tiers.iter() {
        let usage = Statvfs
            .usage(&tier.path)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        tiers.push(TierUsage {
            name: tier.name.clone(),
            path: tier.path.display().to_string(),
            free_blocks: usage.free,
            total_blocks: usage.total,
            used_percent: usage.used_percent(),
            start_percent: tier.watermarks.start_percent,
            stop_percent: tier.watermarks.stop_percent,
        });
    }
    Ok(Json(tiers))
}

async fn list_recordings(
    State(state): State<AppState>,
    Path(tier): Path<String>,
) -> Result<Json<Vec<RecordingInfo>>, StatusCode> {
    let tier = state.tier(&tier).ok_or(StatusCode::NOT_FOUND)?;
    let dir = tier.path.clone();
    let recordings = tokio::task::spawn_blocking(move || settled_recordings(&dir))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(recordings))
}

async fn download_recording(
    State(state): State<AppState>,
    Path((tier, name)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    // Sanitise: prevent directory traversal
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(StatusCode::BAD_REQUEST);
    }
    let tier = state.tier(&tier).ok_or(StatusCode::NOT_FOUND)?;

    let file_path: PathBuf = tier.path.join(&name);
    if !file_path.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }

    let file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let size = file
        .metadata()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .len();
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        [
            (header::CONTENT_TYPE, "video/x-matroska".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        body,
    )
        .into_response())
}

/// Segment files in `dir` that are no longer being written, sorted by name.
fn settled_recordings(dir: &std::path::Path) -> std::io::Result<Vec<RecordingInfo>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let cutoff = SystemTime::now() - SETTLE_TIME;
    let mut recordings = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Ok(meta) = path.metadata() else { continue };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified > cutoff || meta.len() == 0 || !meta.is_file() {
            continue;
        }
        let created = chrono::DateTime::from_timestamp(modified_secs(&meta), 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        recordings.push(RecordingInfo {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            created,
        });
    }

    recordings.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(recordings)
}
