//! Per-camera segment scheduler.
//!
//! Keeps one camera covered by a running muxer at all times and rotates to a
//! new output file at every ten-minute wall-clock boundary.  Two slots are
//! kept: `current` receives the live stream, `previous` is the segment from
//! the last rotation that may still be finalising its container.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use tracing::{info, warn};

use nvr_common::camera::CameraDef;

use crate::error::{RecorderError, Result};
use crate::muxer::Muxer;
use crate::task::{RecordingTask, TaskState};

/// Shortest segment ever requested from the muxer.
pub const MIN_SEGMENT: Duration = Duration::from_secs(10);
/// Longest segment ever requested from the muxer.
pub const MAX_SEGMENT: Duration = Duration::from_secs(3600);
/// Container extension of every segment file.
pub const SEGMENT_EXTENSION: &str = "mkv";

/// The rotation boundary following `now`.
///
/// Rounds to the next multiple of ten minutes past the hour that is at least
/// a minute and a bit away, carrying into the next hour (and day).  Depends on
/// `now` only, so every camera agrees on it without shared state.
pub fn next_rotation(now: NaiveDateTime) -> NaiveDateTime {
    let minute = (now.minute() + 11) / 10 * 10;
    let into_hour = TimeDelta::seconds(i64::from(now.minute() * 60 + now.second()))
        + TimeDelta::nanoseconds(i64::from(now.nanosecond()));
    now - into_hour + TimeDelta::minutes(i64::from(minute))
}

/// Length of a segment started at `now` that should end at `boundary`,
/// clamped to `[MIN_SEGMENT, MAX_SEGMENT]`.
pub fn segment_duration(now: NaiveDateTime, boundary: NaiveDateTime) -> Duration {
    let secs = (boundary - now).num_seconds();
    if secs < MIN_SEGMENT.as_secs() as i64 {
        warn!("Segment duration {secs}s raised to {}s", MIN_SEGMENT.as_secs());
        MIN_SEGMENT
    } else if secs > MAX_SEGMENT.as_secs() as i64 {
        warn!("Segment duration {secs}s limited to {}s", MAX_SEGMENT.as_secs());
        MAX_SEGMENT
    } else {
        Duration::from_secs(secs as u64)
    }
}

/// Output path of a segment for `camera` starting at `now`.
pub fn segment_path(root: &Path, camera: &CameraDef, now: NaiveDateTime) -> PathBuf {
    root.join(format!(
        "{}.{SEGMENT_EXTENSION}",
        now.format(&camera.pattern)
    ))
}

pub struct SegmentScheduler {
    camera: CameraDef,
    root: PathBuf,
    muxer: Arc<dyn Muxer>,
    cancel_grace: Duration,
    next_rotation: Option<NaiveDateTime>,
    current: Option<RecordingTask>,
    previous: Option<RecordingTask>,
}

impl SegmentScheduler {
    pub fn new(
        camera: CameraDef,
        root: PathBuf,
        muxer: Arc<dyn Muxer>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            camera,
            root,
            muxer,
            cancel_grace,
            next_rotation: None,
            current: None,
            previous: None,
        }
    }

    /// Advance the scheduler to `now`.  Any error is fatal for the camera.
    pub fn tick(&mut self, now: NaiveDateTime) -> Result<()> {
        let boundary = *self.next_rotation.get_or_insert_with(|| next_rotation(now));

        self.reap_current()?;
        self.reap_previous()?;

        if now >= boundary {
            // Rotation starts the only segment for `now`.
            self.rotate(now)?;
        } else if self.current.is_none() {
            self.current = Some(self.start_segment(now, boundary)?);
        }
        Ok(())
    }

    /// Tick every `interval` until `shutdown` is set or a fatal error occurs.
    pub fn run(mut self, interval: Duration, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "[{}] scheduler started for {} → {}",
            self.camera.label(),
            self.camera.url,
            self.root.display()
        );
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(Local::now().naive_local()) {
                self.shutdown();
                return Err(e);
            }
            std::thread::sleep(interval);
        }
        self.shutdown();
        info!("[{}] scheduler stopped", self.camera.label());
        Ok(())
    }

    /// Cancel whatever is still recording and wait briefly for it to exit.
    pub fn shutdown(&mut self) {
        for mut task in [self.current.take(), self.previous.take()].into_iter().flatten() {
            let stopped = task
                .cancel()
                .and_then(|()| task.wait_timeout(self.cancel_grace));
            match stopped {
                Ok(state) if state.is_finished() => {}
                Ok(_) => warn!(
                    "[{}] segment {} did not stop within {:?}, killing it",
                    self.camera.label(),
                    task.path().display(),
                    self.cancel_grace
                ),
                Err(e) => warn!("[{}] {e}", self.camera.label()),
            }
        }
    }

    #[cfg(test)]
    pub fn next_rotation(&self) -> Option<NaiveDateTime> {
        self.next_rotation
    }

    /// Number of occupied slots (0..=2).
    #[cfg(test)]
    pub fn active_tasks(&self) -> usize {
        self.current.is_some() as usize + self.previous.is_some() as usize
    }

    fn reap_current(&mut self) -> Result<()> {
        if let Some(task) = self.current.as_mut() {
            if Self::check(&self.camera, task)? {
                self.current = None;
            }
        }
        Ok(())
    }

    fn reap_previous(&mut self) -> Result<()> {
        if let Some(task) = self.previous.as_mut() {
            if Self::check(&self.camera, task)? {
                self.previous = None;
            }
        }
        Ok(())
    }

    /// Poll `task`; true when it finished cleanly and its slot can be freed.
    fn check(camera: &CameraDef, task: &mut RecordingTask) -> Result<bool> {
        match task.poll()? {
            TaskState::Running => Ok(false),
            TaskState::Succeeded | TaskState::Cancelled => Ok(true),
            TaskState::Failed(code) => Err(RecorderError::SegmentFailed {
                camera: camera.label().to_string(),
                path: task.path().to_path_buf(),
                code,
            }),
        }
    }

    fn rotate(&mut self, now: NaiveDateTime) -> Result<()> {
        if let Some(mut previous) = self.previous.take() {
            previous.cancel()?;
            if !previous.wait_timeout(self.cancel_grace)?.is_finished() {
                let path = previous.path().to_path_buf();
                // Leave it in the slot so shutdown() still reaps it.
                self.previous = Some(previous);
                return Err(RecorderError::CancelTimeout {
                    camera: self.camera.label().to_string(),
                    path,
                    grace: self.cancel_grace,
                });
            }
        }

        let boundary = next_rotation(now);
        self.next_rotation = Some(boundary);
        self.previous = self.current.take();
        self.current = Some(self.start_segment(now, boundary)?);
        info!(
            "[{}] rotated at {now}, next rotation at {boundary}",
            self.camera.label()
        );
        Ok(())
    }

    fn start_segment(&self, now: NaiveDateTime, boundary: NaiveDateTime) -> Result<RecordingTask> {
        let path = segment_path(&self.root, &self.camera, now);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RecorderError::SegmentDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        RecordingTask::start(
            self.muxer.as_ref(),
            self.camera.label(),
            &self.camera.url,
            path,
            segment_duration(now, boundary),
        )
    }
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::fake::FakeMuxer;
    use crate::muxer::TaskExit;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nvr_sched_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("hot")
    }

    fn rooftop(root: &Path, muxer: &Arc<FakeMuxer>) -> SegmentScheduler {
        let camera = CameraDef::new("Rooftop", None, "rtsp://127.0.0.1:8554/rooftop").unwrap();
        SegmentScheduler::new(
            camera,
            root.to_path_buf(),
            muxer.clone(),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_next_rotation_examples() {
        assert_eq!(next_rotation(at(12, 3, 0)), at(12, 10, 0));
        assert_eq!(next_rotation(at(12, 0, 0)), at(12, 10, 0));
        assert_eq!(next_rotation(at(12, 9, 59)), at(12, 20, 0));
        assert_eq!(next_rotation(at(12, 10, 0)), at(12, 20, 0));
        assert_eq!(next_rotation(at(12, 50, 0)), at(13, 0, 0));
        let next_day = NaiveDate::from_ymd_opt(2024, 1, 16)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(next_rotation(at(23, 57, 30)), next_day);
    }

    #[test]
    fn test_rotation_boundaries_aligned_and_increasing() {
        let mut now = at(10, 0, 0);
        let end = at(13, 0, 0);
        let mut last = next_rotation(now);
        while now < end {
            let next = next_rotation(now);
            assert!(next > now + TimeDelta::seconds(60), "{now} → {next}");
            assert_eq!(next.minute() % 10, 0);
            assert_eq!(next.second(), 0);
            assert!(next >= last);
            last = next;
            now += TimeDelta::seconds(7);
        }

        // Chained rotations strictly increase.
        let mut boundary = at(12, 3, 0);
        for _ in 0..20 {
            let next = next_rotation(boundary);
            assert!(next > boundary);
            boundary = next;
        }
    }

    #[test]
    fn test_segment_duration_is_clamped() {
        assert_eq!(segment_duration(at(12, 3, 0), at(12, 10, 0)), Duration::from_secs(420));
        assert_eq!(segment_duration(at(12, 9, 55), at(12, 10, 0)), MIN_SEGMENT);
        assert_eq!(segment_duration(at(12, 11, 0), at(12, 10, 0)), MIN_SEGMENT);
        assert_eq!(segment_duration(at(10, 0, 0), at(12, 10, 0)), MAX_SEGMENT);
        for s in (0..7200).step_by(13) {
            let now = at(11, 0, 0) + TimeDelta::seconds(s);
            let d = segment_duration(now, next_rotation(now));
            assert!(d >= MIN_SEGMENT && d <= MAX_SEGMENT);
        }
    }

    #[test]
    fn test_first_tick_starts_one_segment() {
        let root = scratch("first");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();

        assert_eq!(sched.next_rotation(), Some(at(12, 10, 0)));
        assert_eq!(sched.active_tasks(), 1);
        let launches = muxer.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].url, "rtsp://127.0.0.1:8554/rooftop");
        assert_eq!(launches[0].path, root.join("Rooftop_20240115_120300.mkv"));
        assert_eq!(launches[0].duration, Duration::from_secs(420));
        assert!(root.is_dir());
    }

    #[test]
    fn test_rotation_promotes_current_to_previous() {
        let root = scratch("rotate");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        sched.tick(at(12, 5, 0)).unwrap();
        assert_eq!(muxer.launches().len(), 1);

        sched.tick(at(12, 10, 0)).unwrap();
        assert_eq!(sched.active_tasks(), 2);
        assert_eq!(sched.next_rotation(), Some(at(12, 20, 0)));
        {
            let launches = muxer.launches();
            assert_eq!(launches.len(), 2);
            assert_eq!(launches[1].path, root.join("Rooftop_20240115_121000.mkv"));
            assert_eq!(launches[1].duration, Duration::from_secs(600));
        }
        assert!(!muxer.task(0).interrupted());

        // The previous segment finishes flushing on its own.
        muxer.task(0).finish(TaskExit::Success);
        sched.tick(at(12, 10, 1)).unwrap();
        assert_eq!(sched.active_tasks(), 1);
        assert_eq!(muxer.launches().len(), 2);
    }

    #[test]
    fn test_lingering_previous_is_cancelled_at_next_rotation() {
        let root = scratch("linger");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        let mut now = at(12, 3, 0);
        let end = at(12, 45, 0);
        while now <= end {
            sched.tick(now).unwrap();
            assert!(muxer.running() <= 2, "more than two tasks at {now}");
            assert!(sched.active_tasks() <= 2);
            now += TimeDelta::seconds(30);
        }

        // Rotations at 12:10, 12:20, 12:30, 12:40 → five segments.
        assert_eq!(muxer.launches().len(), 5);
        assert!(muxer.task(0).interrupted());
        assert!(muxer.task(1).interrupted());
        assert!(muxer.task(2).interrupted());
        assert!(!muxer.task(3).interrupted());
        assert!(!muxer.task(4).interrupted());
    }

    #[test]
    fn test_stuck_previous_is_fatal() {
        let root = scratch("stuck");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        sched.tick(at(12, 10, 0)).unwrap();
        muxer.task(0).ignore_interrupt();

        let err = sched.tick(at(12, 20, 0)).unwrap_err();
        assert!(matches!(err, RecorderError::CancelTimeout { .. }), "{err}");
        // Nothing new was started over the leaked task.
        assert_eq!(muxer.launches().len(), 2);
    }

    #[test]
    fn test_failed_current_is_fatal_with_code() {
        let root = scratch("failed");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        muxer.task(0).finish(TaskExit::Failure(Some(1)));
        match sched.tick(at(12, 3, 1)) {
            Err(RecorderError::SegmentFailed { code, camera, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(camera, "Rooftop");
            }
            other => panic!("expected SegmentFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_previous_is_fatal() {
        let root = scratch("failed_prev");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        sched.tick(at(12, 10, 0)).unwrap();
        muxer.task(0).finish(TaskExit::Failure(None));
        assert!(matches!(
            sched.tick(at(12, 10, 1)),
            Err(RecorderError::SegmentFailed { code: None, .. })
        ));
    }

    #[test]
    fn test_completed_current_restarts_immediately() {
        let root = scratch("restart");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        muxer.task(0).finish(TaskExit::Success);
        sched.tick(at(12, 5, 1)).unwrap();
        sched.tick(at(12, 9, 55)).unwrap();

        let launches = muxer.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[1].duration, Duration::from_secs(299));
        assert_eq!(launches[1].path, root.join("Rooftop_20240115_120501.mkv"));
    }

    #[test]
    fn test_current_ending_before_boundary_starts_one_segment() {
        let root = scratch("ended_at_boundary");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        muxer.task(0).finish(TaskExit::Success);
        sched.tick(at(12, 10, 0)).unwrap();

        {
            let launches = muxer.launches();
            assert_eq!(launches.len(), 2);
            assert_eq!(launches[1].path, root.join("Rooftop_20240115_121000.mkv"));
            assert_eq!(launches[1].duration, Duration::from_secs(600));
        }
        assert_eq!(muxer.running(), 1);
        assert_eq!(sched.active_tasks(), 1);
        assert_eq!(sched.next_rotation(), Some(at(12, 20, 0)));
    }

    #[test]
    fn test_restart_near_boundary_uses_floor() {
        let root = scratch("floor");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        muxer.task(0).finish(TaskExit::Success);
        sched.tick(at(12, 9, 58)).unwrap();
        assert_eq!(muxer.launches()[1].duration, MIN_SEGMENT);
    }

    #[test]
    fn test_launch_failure_is_fatal() {
        let root = scratch("launch");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);
        muxer.fail_next_launch();
        assert!(matches!(
            sched.tick(at(12, 3, 0)),
            Err(RecorderError::Launch { .. })
        ));
    }

    #[test]
    fn test_custom_pattern_creates_subdirectories() {
        let root = scratch("pattern");
        let muxer = Arc::new(FakeMuxer::default());
        let camera = CameraDef::new("Road", Some("road/%Y-%m-%d/%H%M%S"), "rtsp://h/road").unwrap();
        let mut sched = SegmentScheduler::new(camera, root.clone(), muxer.clone(), Duration::ZERO);

        sched.tick(at(12, 3, 0)).unwrap();
        assert_eq!(
            muxer.launches()[0].path,
            root.join("road/2024-01-15/120300.mkv")
        );
        assert!(root.join("road/2024-01-15").is_dir());
    }

    #[test]
    fn test_shutdown_cancels_both_slots() {
        let root = scratch("shutdown");
        let muxer = Arc::new(FakeMuxer::default());
        let mut sched = rooftop(&root, &muxer);

        sched.tick(at(12, 3, 0)).unwrap();
        sched.tick(at(12, 10, 0)).unwrap();
        sched.shutdown();

        assert_eq!(sched.active_tasks(), 0);
        assert!(muxer.task(0).interrupted());
        assert!(muxer.task(1).interrupted());
        assert_eq!(muxer.running(), 0);
    }
}
