//! Recording task – one muxer run producing one segment file.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{RecorderError, Result};
use crate::muxer::{Muxer, TaskExit, TaskHandle};

/// Poll step used while waiting for a cancelled task.
const CANCEL_POLL_STEP: Duration = Duration::from_millis(50);

/// Lifecycle of a recording task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed(Option<i32>),
    /// Exited after the scheduler asked it to stop.
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

pub struct RecordingTask {
    camera: String,
    path: PathBuf,
    duration: Duration,
    started: Instant,
    handle: Box<dyn TaskHandle>,
    cancel_requested: bool,
    state: TaskState,
}

impl RecordingTask {
    /// Launch the muxer and return immediately.
    pub fn start(
        muxer: &dyn Muxer,
        camera: &str,
        url: &str,
        path: PathBuf,
        duration: Duration,
    ) -> Result<Self> {
        let handle = muxer
            .launch(url, &path, duration)
            .map_err(|source| RecorderError::Launch {
                camera: camera.to_string(),
                path: path.clone(),
                source,
            })?;
        info!(
            "[{camera}] recording {url} → {} for {}s (task {})",
            path.display(),
            duration.as_secs(),
            handle.id()
        );
        Ok(Self {
            camera: camera.to_string(),
            path,
            duration,
            started: Instant::now(),
            handle,
            cancel_requested: false,
            state: TaskState::Running,
        })
    }

    /// Non-blocking completion check.  A finished state is sticky.
    pub fn poll(&mut self) -> Result<TaskState> {
        if self.state.is_finished() {
            return Ok(self.state);
        }
        let exit = self
            .handle
            .try_wait()
            .map_err(|source| RecorderError::Poll {
                camera: self.camera.clone(),
                source,
            })?;
        self.state = match exit {
            None => TaskState::Running,
            Some(exit) if self.cancel_requested => {
                debug!(
                    "[{}] cancelled segment {} exited with {exit:?}",
                    self.camera,
                    self.path.display()
                );
                TaskState::Cancelled
            }
            Some(TaskExit::Success) => TaskState::Succeeded,
            Some(TaskExit::Failure(code)) => TaskState::Failed(code),
        };
        if self.state.is_finished() {
            debug!(
                "[{}] segment {} finished as {:?} after {:?} of {}s",
                self.camera,
                self.path.display(),
                self.state,
                self.started.elapsed(),
                self.duration.as_secs()
            );
        }
        Ok(self.state)
    }

    /// Request termination without waiting for it.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state.is_finished() {
            return Ok(());
        }
        warn!(
            "[{}] cancelling segment {} (task {})",
            self.camera,
            self.path.display(),
            self.handle.id()
        );
        self.cancel_requested = true;
        self.handle
            .interrupt()
            .map_err(|source| RecorderError::Cancel {
                camera: self.camera.clone(),
                source,
            })
    }

    /// Poll until the task finishes or `grace` elapses.
    pub fn wait_timeout(&mut self, grace: Duration) -> Result<TaskState> {
        let deadline = Instant::now() + grace;
        loop {
            let state = self.poll()?;
            if state.is_finished() || Instant::now() >= deadline {
                return Ok(state);
            }
            std::thread::sleep(CANCEL_POLL_STEP);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}
