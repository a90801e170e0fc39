//! Fatal recorder errors.
//!
//! Anything that reaches the orchestrator as a `RecorderError` stops the
//! whole process; recoverable conditions are handled where they occur.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("failed to launch muxer for camera '{camera}' into {}: {source}", .path.display())]
    Launch {
        camera: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("cannot create segment directory {}: {source}", .path.display())]
    SegmentDir { path: PathBuf, source: io::Error },

    #[error("cannot poll recording task for camera '{camera}': {source}")]
    Poll { camera: String, source: io::Error },

    #[error("recording for camera '{camera}' into {} exited with {}", .path.display(), describe_code(.code))]
    SegmentFailed {
        camera: String,
        path: PathBuf,
        code: Option<i32>,
    },

    #[error("cannot signal recording task for camera '{camera}': {source}")]
    Cancel { camera: String, source: io::Error },

    #[error("previous segment for camera '{camera}' ({}) still running {grace:?} after cancellation", .path.display())]
    CancelTimeout {
        camera: String,
        path: PathBuf,
        grace: Duration,
    },

    #[error("cannot read filesystem usage of {}: {source}", .path.display())]
    Usage { path: PathBuf, source: io::Error },

    #[error("cannot scan directory {}: {source}", .path.display())]
    Scan { path: PathBuf, source: io::Error },

    #[error("cannot evict {}: {source}", .path.display())]
    Evict { path: PathBuf, source: io::Error },

    #[error("{component} control loop panicked")]
    Panicked { component: String },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
