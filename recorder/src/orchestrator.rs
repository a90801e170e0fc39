//! Orchestrator – starts one scheduler thread per camera and one retention
//! thread per tier, and stops everything as soon as any of them fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use nvr_common::config::Config;

use crate::error::RecorderError;
use crate::muxer::Muxer;
use crate::retention::RetentionEngine;
use crate::scheduler::SegmentScheduler;
use crate::tier::{ensure_dir, Eviction, Tier};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(200);

/// The hot tier (archived on pressure) and the archive tier (deleted).
pub fn tiers(config: &Config) -> [Tier; 2] {
    [
        Tier::new(
            "hot",
            config.hot_dir.clone(),
            config.hot_watermarks,
            Eviction::Archive {
                target: config.archive_dir.clone(),
            },
        ),
        Tier::new(
            "archive",
            config.archive_dir.clone(),
            config.archive_watermarks,
            Eviction::Delete,
        ),
    ]
}

/// A control loop that returned.
struct Exit {
    component: String,
    result: Result<(), RecorderError>,
}

pub struct Orchestrator {
    config: Config,
    muxer: Arc<dyn Muxer>,
    shutdown: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, muxer: Arc<dyn Muxer>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            config,
            muxer,
            shutdown,
        }
    }

    /// Run until `shutdown` is set (Ok) or a component fails (Err).
    pub fn run(self) -> Result<()> {
        let tiers = tiers(&self.config);
        for tier in &tiers {
            ensure_dir(&tier.path)
                .with_context(|| format!("Cannot create {} tier {}", tier.name, tier.path.display()))?;
        }

        let (tx, rx) = mpsc::channel::<Exit>();
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();

        let spawned = self.spawn_all(tiers, &tx, &mut handles);
        drop(tx);
        if let Err(e) = spawned {
            self.shutdown.store(true, Ordering::SeqCst);
            join_all(handles);
            return Err(e);
        }
        info!(
            "Recording {} camera(s) into {}",
            self.config.cameras.len(),
            self.config.hot_dir.display()
        );

        let failure = self.supervise(&rx, &handles);

        self.shutdown.store(true, Ordering::SeqCst);
        info!("Stopping {} component(s)...", handles.len());
        join_all(handles);
        for exit in rx.try_iter() {
            if let Err(e) = exit.result {
                warn!("{} also failed during shutdown: {e}", exit.component);
            }
        }

        match failure {
            Some((component, e)) => Err(anyhow::Error::new(e).context(format!("{component} failed"))),
            None => {
                info!("All components stopped");
                Ok(())
            }
        }
    }

    fn spawn_all(
        &self,
        tiers: [Tier; 2],
        tx: &mpsc::Sender<Exit>,
        handles: &mut Vec<(String, JoinHandle<()>)>,
    ) -> Result<()> {
        for tier in tiers {
            let component = format!("{} tier retention", tier.name);
            let engine = RetentionEngine::new(tier);
            let interval = self.config.retention_interval;
            let shutdown = self.shutdown.clone();
            let handle = spawn_component(&component, tx, move || engine.run(interval, &shutdown))?;
            handles.push((component, handle));
        }

        for camera in &self.config.cameras {
            let component = format!("camera '{}'", camera.label());
            let scheduler = SegmentScheduler::new(
                camera.clone(),
                self.config.hot_dir.clone(),
                self.muxer.clone(),
                self.config.cancel_grace,
            );
            let interval = self.config.scheduler_interval;
            let shutdown = self.shutdown.clone();
            let handle =
                spawn_component(&component, tx, move || scheduler.run(interval, &shutdown))?;
            handles.push((component, handle));
        }
        Ok(())
    }

    /// Wait for shutdown or the first failure.
    fn supervise(
        &self,
        rx: &mpsc::Receiver<Exit>,
        handles: &[(String, JoinHandle<()>)],
    ) -> Option<(String, RecorderError)> {
        loop {
            match rx.recv_timeout(SUPERVISE_INTERVAL) {
                Ok(Exit {
                    component,
                    result: Err(e),
                }) => {
                    error!("{component} failed: {e}");
                    return Some((component, e));
                }
                Ok(Exit { component, .. }) => {
                    if !self.shutdown.load(Ordering::SeqCst) {
                        warn!("{component} stopped");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return None;
                    }
                    // A panicked thread never reports back.
                    if let Some((component, _)) = handles.iter().find(|(_, h)| h.is_finished()) {
                        if let Ok(exit) = rx.try_recv() {
                            if let Err(e) = exit.result {
                                error!("{} failed: {e}", exit.component);
                                return Some((exit.component, e));
                            }
                            continue;
                        }
                        error!("{component} exited unexpectedly");
                        return Some((
                            component.clone(),
                            RecorderError::Panicked {
                                component: component.clone(),
                            },
                        ));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn spawn_component<F>(component: &str, tx: &mpsc::Sender<Exit>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<(), RecorderError> + Send + 'static,
{
    let tx = tx.clone();
    let name = component.to_string();
    thread::Builder::new()
        .name(component.chars().filter(|c| c.is_ascii_alphanumeric() || *c == ' ').collect())
        .spawn(move || {
            let result = body();
            let _ = tx.send(Exit {
                component: name,
                result,
            });
        })
        .with_context(|| format!("Cannot spawn thread for {component}"))
}

fn join_all(handles: Vec<(String, JoinHandle<()>)>) {
    for (component, handle) in handles {
        if handle.join().is_err() {
            warn!("{component} thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::fake::FakeMuxer;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nvr_orch_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(dir: &std::path::Path) -> Config {
        let text = format!(
            "CAMERAS=\"Rooftop::rtsp://127.0.0.1:8554/rooftop,Road::rtsp://127.0.0.1:8554/road\"\n\
             HOT_DIR={}\nARCHIVE_DIR={}\n\
             HOT_START_PERCENT=100\nHOT_STOP_PERCENT=100\n\
             ARCHIVE_START_PERCENT=100\nARCHIVE_STOP_PERCENT=100\n\
             SCHEDULER_INTERVAL_MS=20\nRETENTION_INTERVAL_SECS=1\nCANCEL_GRACE_MS=100\n",
            dir.join("hot").display(),
            dir.join("archived").display(),
        );
        nvr_common::config::from_str(&text).unwrap()
    }

    #[test]
    fn test_tiers_from_config() {
        let dir = scratch("tiers");
        let [hot, archive] = tiers(&config(&dir));
        assert_eq!(hot.path, dir.join("hot"));
        assert_eq!(
            hot.eviction,
            Eviction::Archive {
                target: dir.join("archived")
            }
        );
        assert_eq!(archive.eviction, Eviction::Delete);
    }

    #[test]
    fn test_runs_every_camera_until_shutdown() {
        let dir = scratch("run");
        let muxer = Arc::new(FakeMuxer::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let orchestrator = Orchestrator::new(config(&dir), muxer.clone(), shutdown.clone());

        let handle = thread::spawn(move || orchestrator.run());
        thread::sleep(Duration::from_millis(500));
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();

        assert!(dir.join("hot").is_dir());
        assert!(dir.join("archived").is_dir());
        let launches = muxer.launches();
        assert_eq!(launches.len(), 2);
        assert!(launches.iter().any(|l| l.url.ends_with("/rooftop")));
        assert!(launches.iter().any(|l| l.url.ends_with("/road")));
        assert!(launches.iter().all(|l| l.path.starts_with(dir.join("hot"))));
        assert!(launches.iter().all(|l| l.task.interrupted()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_camera_failure_stops_everything() {
        let dir = scratch("fatal");
        let muxer = Arc::new(FakeMuxer::default());
        muxer.fail_next_launch();
        let shutdown = Arc::new(AtomicBool::new(false));
        let orchestrator = Orchestrator::new(config(&dir), muxer.clone(), shutdown.clone());

        let err = orchestrator.run().unwrap_err();
        assert!(format!("{err:#}").contains("failed to launch muxer"), "{err:#}");
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(muxer.running(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unusable_tier_root_is_fatal() {
        let dir = scratch("badroot");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hot"), b"not a directory").unwrap();
        let orchestrator = Orchestrator::new(
            config(&dir),
            Arc::new(FakeMuxer::default()),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(orchestrator.run().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
