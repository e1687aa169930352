//! Time-based sweep of the temp-upload directory.
//!
//! A file is deleted once it is older than the age threshold, unless a
//! pending or in-progress task still references it. The protected set is
//! recomputed on every sweep.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};

use crate::config::CleanupConfig;
use crate::error::{ServiceError, ServiceResult, format_error_chain};

/// Sleep granularity of the sweep loop
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Supplies the paths that must survive a sweep
pub type ProtectedPaths = Arc<dyn Fn() -> HashSet<PathBuf> + Send + Sync>;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub protected: usize,
    pub too_recent: usize,
    pub errors: usize,
}

/// Classification of the temp directory without deleting anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TempDirSnapshot {
    pub total: usize,
    pub protected: usize,
    pub cleanable: usize,
}

struct Sweeper {
    temp_dir: PathBuf,
    file_age_threshold: Duration,
    protected: ProtectedPaths,
}

enum Verdict {
    Protected,
    TooRecent,
    Expired,
}

impl Sweeper {
    /// Protected paths plus their canonical forms, so `./x` and `x` compare equal
    fn protected_set(&self) -> HashSet<PathBuf> {
        let raw = (self.protected)();
        let canonical: Vec<PathBuf> = raw
            .iter()
            .filter_map(|p| std::fs::canonicalize(p).ok())
            .collect();
        raw.into_iter().chain(canonical).collect()
    }

    fn is_protected(path: &Path, protected: &HashSet<PathBuf>) -> bool {
        protected.contains(path)
            || std::fs::canonicalize(path).is_ok_and(|c| protected.contains(&c))
    }

    fn temp_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.temp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn classify(&self, path: &Path, protected: &HashSet<PathBuf>) -> std::io::Result<Verdict> {
        if Self::is_protected(path, protected) {
            return Ok(Verdict::Protected);
        }
        let modified = std::fs::metadata(path)?.modified()?;
        // mtimes in the future count as age zero
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age >= self.file_age_threshold {
            Ok(Verdict::Expired)
        } else {
            Ok(Verdict::TooRecent)
        }
    }

    fn sweep(&self) -> ServiceResult<SweepReport> {
        let files = self.temp_files().map_err(|source| ServiceError::Cleanup {
            path: self.temp_dir.clone(),
            source,
        })?;
        let protected = self.protected_set();
        let mut report = SweepReport {
            scanned: files.len(),
            ..SweepReport::default()
        };

        for path in files {
            let result = self
                .classify(&path, &protected)
                .and_then(|verdict| match verdict {
                    Verdict::Protected => {
                        report.protected += 1;
                        Ok(())
                    }
                    Verdict::TooRecent => {
                        report.too_recent += 1;
                        Ok(())
                    }
                    Verdict::Expired => std::fs::remove_file(&path).map(|()| {
                        debug!(path = %path.display(), "Deleted expired temp file");
                        report.deleted += 1;
                    }),
                });

            if let Err(source) = result {
                // Raced with the owning task removing its own file
                if source.kind() == std::io::ErrorKind::NotFound {
                    continue;
                }
                let e = ServiceError::Cleanup {
                    path: path.clone(),
                    source,
                };
                warn!(error = %format_error_chain(&e), "Skipping temp file");
                report.errors += 1;
            }
        }

        Ok(report)
    }

    fn snapshot(&self) -> TempDirSnapshot {
        let Ok(files) = self.temp_files() else {
            return TempDirSnapshot::default();
        };
        let protected = self.protected_set();
        let mut snapshot = TempDirSnapshot {
            total: files.len(),
            ..TempDirSnapshot::default()
        };
        for path in files {
            match self.classify(&path, &protected) {
                Ok(Verdict::Protected) => snapshot.protected += 1,
                Ok(Verdict::Expired) => snapshot.cleanable += 1,
                Ok(Verdict::TooRecent) | Err(_) => {}
            }
        }
        snapshot
    }
}

/// Owns the background sweep thread
pub struct CleanupManager {
    sweeper: Arc<Sweeper>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        config: &CleanupConfig,
        protected: ProtectedPaths,
    ) -> Self {
        Self {
            sweeper: Arc::new(Sweeper {
                temp_dir: temp_dir.into(),
                file_age_threshold: config.file_age_threshold(),
                protected,
            }),
            interval: config.interval(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.sweeper.temp_dir
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn file_age_threshold(&self) -> Duration {
        self.sweeper.file_age_threshold
    }

    /// Run one sweep now
    pub fn perform_scan(&self) -> ServiceResult<SweepReport> {
        self.sweeper.sweep()
    }

    pub fn snapshot(&self) -> TempDirSnapshot {
        self.sweeper.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Start the sweep thread. Calling it while running is a no-op.
    pub fn start(&self) -> ServiceResult<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);
        let sweeper = self.sweeper.clone();
        let stop = self.stop.clone();
        let interval = self.interval;

        let spawned = thread::Builder::new()
            .name("cleanup-manager".to_string())
            .spawn(move || cleanup_loop(&sweeper, interval, &stop))
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to spawn cleanup thread: {}", e),
            })?;
        *handle = Some(spawned);

        info!(
            temp_dir = %self.sweeper.temp_dir.display(),
            interval_secs = self.interval.as_secs(),
            file_age_threshold_secs = self.sweeper.file_age_threshold.as_secs(),
            "Cleanup manager started"
        );
        Ok(())
    }

    /// Stop the sweep thread and wait for it to exit
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Cleanup thread exited with a panic");
            }
            info!("Cleanup manager stopped");
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn cleanup_loop(sweeper: &Sweeper, interval: Duration, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match panic::catch_unwind(AssertUnwindSafe(|| sweeper.sweep())) {
            Ok(Ok(report)) => {
                if report.deleted > 0 || report.errors > 0 {
                    info!(
                        deleted = report.deleted,
                        protected = report.protected,
                        errors = report.errors,
                        "Temp directory sweep finished"
                    );
                } else {
                    debug!(
                        scanned = report.scanned,
                        "Temp directory sweep found nothing to delete"
                    );
                }
            }
            Ok(Err(e)) => error!(error = %format_error_chain(&e), "Temp directory sweep failed"),
            Err(_) => error!("Temp directory sweep panicked"),
        }

        let next_sweep = Instant::now() + interval;
        while !stop.load(Ordering::SeqCst) && Instant::now() < next_sweep {
            let remaining = next_sweep.saturating_duration_since(Instant::now());
            thread::sleep(STOP_POLL_INTERVAL.min(remaining));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{NewTask, TaskManager};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn config(threshold_secs: u64) -> CleanupConfig {
        CleanupConfig {
            interval_secs: 1,
            file_age_threshold_secs: threshold_secs,
        }
    }

    fn nothing_protected() -> ProtectedPaths {
        Arc::new(HashSet::<PathBuf>::new)
    }

    #[test]
    fn test_deletes_only_expired_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.pdf"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("worker_file_lists")).unwrap();
        std::fs::write(dir.path().join("worker_file_lists").join("list.json"), b"{}").unwrap();

        let keep_all = CleanupManager::new(dir.path(), &config(3600), nothing_protected());
        let report = keep_all.perform_scan().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.too_recent, 1);
        assert!(dir.path().join("old.pdf").exists());

        let delete_all = CleanupManager::new(dir.path(), &config(0), nothing_protected());
        assert_eq!(delete_all.snapshot().cleanable, 1);
        let report = delete_all.perform_scan().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!dir.path().join("old.pdf").exists());
        // subdirectories are never swept
        assert!(dir.path().join("worker_file_lists").join("list.json").exists());
    }

    #[test]
    fn test_missing_temp_dir_is_a_cleanup_error() {
        let dir = TempDir::new().unwrap();
        let manager = CleanupManager::new(dir.path().join("gone"), &config(0), nothing_protected());
        assert!(matches!(
            manager.perform_scan(),
            Err(ServiceError::Cleanup { .. })
        ));
        assert_eq!(manager.snapshot(), TempDirSnapshot::default());
    }

    #[test]
    fn test_active_task_file_survives_until_task_finishes() {
        let dir = TempDir::new().unwrap();
        let upload = dir.path().join("report.pdf");
        std::fs::write(&upload, b"%PDF").unwrap();

        let tasks = Arc::new(TaskManager::new(1).unwrap());
        let (release, gate) = mpsc::channel::<()>();
        tasks
            .add_task(
                NewTask::new("hold").upload("w-1", "report.pdf", upload.clone(), 4),
                Box::new(move |_| {
                    let _ = gate.recv();
                    Ok(())
                }),
            )
            .unwrap();

        let source = tasks.clone();
        let manager = CleanupManager::new(
            dir.path(),
            &config(0),
            Arc::new(move || source.active_file_paths()),
        );

        for _ in 0..3 {
            let report = manager.perform_scan().unwrap();
            assert_eq!(report.protected, 1);
            assert!(upload.exists());
        }

        release.send(()).unwrap();
        assert!(tasks.wait_for_completion(Some(Duration::from_secs(10))));

        let report = manager.perform_scan().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!upload.exists());
        tasks.shutdown(false, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_background_loop_sweeps_and_stops() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("stale.txt");
        std::fs::write(&file, b"x").unwrap();

        let manager = CleanupManager::new(dir.path(), &config(0), nothing_protected());
        manager.start().unwrap();
        assert!(manager.is_running());

        let deadline = Instant::now() + Duration::from_secs(10);
        while file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!file.exists());

        manager.stop();
        assert!(!manager.is_running());
    }
}
