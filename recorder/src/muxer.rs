//! Muxer invocation – spawns `ffmpeg` child processes that copy one camera
//! stream into one container file for a bounded duration.

use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

/// Extra run time handed to the muxer so the last keyframe before the
/// rotation boundary is not cut off.
pub const DURATION_MARGIN: Duration = Duration::from_secs(5);

/// How a finished muxer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    Success,
    /// Non-zero exit; `None` when terminated by a signal.
    Failure(Option<i32>),
}

/// A running muxer instance.
pub trait TaskHandle: Send {
    /// Process (or thread) identifier, for logs.
    fn id(&self) -> u32;

    /// Non-blocking completion check.
    fn try_wait(&mut self) -> io::Result<Option<TaskExit>>;

    /// Ask the muxer to stop and finalise its output.  Must not block.
    fn interrupt(&mut self) -> io::Result<()>;
}

/// Something that can record `url` into `output` for `duration`.
pub trait Muxer: Send + Sync {
    fn launch(
        &self,
        url: &str,
        output: &Path,
        duration: Duration,
    ) -> io::Result<Box<dyn TaskHandle>>;
}

// ── ffmpeg ───────────────────────────────────────────────────────────────

/// Stream-copy muxer backed by the `ffmpeg` CLI.
pub struct FfmpegMuxer {
    bin: String,
}

impl FfmpegMuxer {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self, url: &str, output: &Path, duration: Duration) -> Command {
        let timeout_args: &[&str] = if url.starts_with("rtsp://") || url.starts_with("rtsps://") {
            &["-timeout", "10000000"]
        } else if url.contains("://") {
            &["-rw_timeout", "10000000"]
        } else {
            &[]
        };
        let run_secs = (duration + DURATION_MARGIN).as_secs();

        let mut cmd = Command::new(&self.bin);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        cmd.args(["-use_wallclock_as_timestamps", "1"]);
        cmd.args(timeout_args);
        cmd.arg("-i").arg(url);
        cmd.args(["-c", "copy", "-t", &run_secs.to_string(), "-y"]);
        cmd.arg(output);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Muxer for FfmpegMuxer {
    fn launch(
        &self,
        url: &str,
        output: &Path,
        duration: Duration,
    ) -> io::Result<Box<dyn TaskHandle>> {
        let mut task = ChildTask {
            child: self.command(url, output, duration).spawn()?,
        };
        let pid = task.child.id();

        // Drain stderr in a background thread so we see ffmpeg errors
        // and the pipe buffer doesn't fill up and block the muxer.
        if let Some(stderr) = task.child.stderr.take() {
            let label = output.display().to_string();
            std::thread::Builder::new()
                .name(format!("ffmpeg-{pid}-stderr"))
                .spawn(move || {
                    let reader = BufReader::new(stderr);
                    for line in reader.lines() {
                        match line {
                            Ok(l) if l.is_empty() => {}
                            Ok(l) => warn!("[ffmpeg {label}] {l}"),
                            Err(_) => break,
                        }
                    }
                    debug!("ffmpeg stderr for {label} ended");
                })?;
        }

        Ok(Box::new(task))
    }
}

/// Owns a muxer child process.  Reaped on drop so no zombie is left behind.
pub struct ChildTask {
    child: Child,
}

impl ChildTask {
    #[cfg(test)]
    pub fn spawn(cmd: &mut Command) -> io::Result<Self> {
        Ok(Self { child: cmd.spawn()? })
    }
}

impl TaskHandle for ChildTask {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<TaskExit>> {
        Ok(self.child.try_wait()?.map(|status| {
            if status.success() {
                TaskExit::Success
            } else {
                TaskExit::Failure(status.code())
            }
        }))
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> io::Result<()> {
        // SIGINT lets ffmpeg write the container trailer before exiting.
        let r = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGINT) };
        if r == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already exited, waiting to be reaped.
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}

impl Drop for ChildTask {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("Killing muxer pid {} that was still running", self.child.id());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::time::Instant;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a: &OsStr| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_ffmpeg_args_for_rtsp() {
        let muxer = FfmpegMuxer::new("ffmpeg");
        let cmd = muxer.command(
            "rtsp://127.0.0.1:8554/rooftop",
            Path::new("hot/Rooftop_20240115_120300.mkv"),
            Duration::from_secs(420),
        );
        assert_eq!(cmd.get_program(), "ffmpeg");
        let args = args_of(&cmd);
        let joined = args.join(" ");
        assert!(joined.contains("-timeout 10000000 -i rtsp://127.0.0.1:8554/rooftop"));
        assert!(joined.contains("-c copy -t 425 -y hot/Rooftop_20240115_120300.mkv"));
        assert!(joined.contains("-use_wallclock_as_timestamps 1"));
    }

    #[test]
    fn test_ffmpeg_args_for_http_and_files() {
        let muxer = FfmpegMuxer::new("/usr/bin/ffmpeg");
        let http = args_of(&muxer.command("http://cam/stream", Path::new("o.mkv"), Duration::from_secs(10)));
        assert!(http.contains(&"-rw_timeout".to_string()));
        let file = args_of(&muxer.command("/dev/video0", Path::new("o.mkv"), Duration::from_secs(10)));
        assert!(!file.iter().any(|a| a.contains("timeout")));
    }

    #[cfg(unix)]
    fn wait_exit(task: &mut ChildTask) -> TaskExit {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(exit) = task.try_wait().unwrap() {
                return exit;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_child_task_reports_exit_codes() {
        let mut ok = ChildTask::spawn(Command::new("sh").args(["-c", "exit 0"])).unwrap();
        assert_eq!(wait_exit(&mut ok), TaskExit::Success);

        let mut failed = ChildTask::spawn(Command::new("sh").args(["-c", "exit 3"])).unwrap();
        assert_eq!(wait_exit(&mut failed), TaskExit::Failure(Some(3)));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_task_interrupt_stops_process() {
        let mut task = ChildTask::spawn(&mut Command::new("sleep").arg("30")).unwrap();
        assert_eq!(task.try_wait().unwrap(), None);
        task.interrupt().unwrap();
        assert_eq!(wait_exit(&mut task), TaskExit::Failure(None));
        // Interrupting an exited child is harmless.
        task.interrupt().unwrap();
    }
}
