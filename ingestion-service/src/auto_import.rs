//! Inbox directory poller.
//!
//! Picks up supported documents dropped into the configured inbox, moves
//! them into the temp directory and submits them as uploads. Files that
//! cannot be staged or submitted are moved to a `failed/` subdirectory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::IngestionCoordinator;
use crate::error::{ServiceError, ServiceResult};

/// Supported file extensions for the inbox
const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "txt", "csv", "json", "md"];

/// Directory to skip when scanning (case-insensitive)
const FAILED_DIRECTORY: &str = "failed";

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Start polling `inbox_dir` until `cancel` fires
pub fn start_inbox_poller(
    coordinator: Arc<IngestionCoordinator>,
    inbox_dir: PathBuf,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %inbox_dir.display(), "Inbox poller started");

        if let Err(e) = std::fs::create_dir_all(inbox_dir.join(FAILED_DIRECTORY)) {
            error!(error = %e, "Failed to create inbox failed directory, poller stopping");
            return;
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match scan_and_process_one(&coordinator, &inbox_dir) {
                Ok(Some(filename)) => {
                    debug!(file = %filename, "Inbox file handled");
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Inbox scan error"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        info!("Inbox poller stopped");
    })
}

/// Recursively collect supported files, skipping the root `failed/` directory
fn collect_files_recursive(
    dir: &Path,
    base_dir: &Path,
    files: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && path.parent() == Some(base_dir)
                && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
            {
                continue;
            }
            collect_files_recursive(&path, base_dir, files)?;
        } else if path.is_file() && is_supported_format(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Handle the first inbox file in path order. Returns its inbox-relative path.
fn scan_and_process_one(
    coordinator: &Arc<IngestionCoordinator>,
    inbox_dir: &Path,
) -> ServiceResult<Option<String>> {
    let mut files = Vec::new();
    collect_files_recursive(inbox_dir, inbox_dir, &mut files).map_err(|source| {
        ServiceError::Cleanup {
            path: inbox_dir.to_path_buf(),
            source,
        }
    })?;

    files.sort();
    let Some(file_path) = files.first() else {
        return Ok(None);
    };
    let relative = file_path
        .strip_prefix(inbox_dir)
        .unwrap_or(file_path)
        .to_path_buf();
    let display_path = relative.display().to_string();

    match submit_file(coordinator, file_path) {
        Ok(work_id) => {
            info!(file = %display_path, work_id = %work_id, "Inbox file queued");
        }
        Err((current, e)) => {
            error!(file = %display_path, error = %e, "Inbox import failed");
            move_to_failed(&current, &inbox_dir.join(FAILED_DIRECTORY).join(&relative));
        }
    }
    cleanup_empty_dirs(file_path.parent(), inbox_dir);
    Ok(Some(display_path))
}

/// Stage one file and submit it.
///
/// On failure returns where the file now lives so it can be set aside.
fn submit_file(
    coordinator: &Arc<IngestionCoordinator>,
    file_path: &Path,
) -> Result<String, (PathBuf, ServiceError)> {
    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let size = std::fs::metadata(file_path)
        .map(|m| m.len())
        .map_err(|source| {
            (
                file_path.to_path_buf(),
                ServiceError::Cleanup {
                    path: file_path.to_path_buf(),
                    source,
                },
            )
        })?;

    let staged = coordinator
        .config()
        .storage
        .temp_dir
        .join(format!("{}_{}", uuid::Uuid::new_v4(), filename));
    stage_file(file_path, &staged).map_err(|source| {
        (
            file_path.to_path_buf(),
            ServiceError::Cleanup {
                path: staged.clone(),
                source,
            },
        )
    })?;

    coordinator
        .create_upload_record(&filename, staged.clone(), size, None)
        .map_err(|e| (staged, e))
}

/// Move an inbox file into the temp directory.
///
/// The staged copy is stamped with the current time; a rename keeps the inbox
/// mtime, which could make it look expired to the temp-file sweep before its
/// task is queued.
fn stage_file(from: &Path, to: &Path) -> std::io::Result<()> {
    move_file(from, to)?;
    std::fs::File::options()
        .write(true)
        .open(to)?
        .set_modified(SystemTime::now())
}

/// Rename, falling back to copy and delete across filesystems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

fn move_to_failed(file_path: &Path, dest: &Path) {
    if let Some(parent) = dest.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(dest = %parent.display(), error = %e, "Failed to create directory in failed/");
        return;
    }

    if let Err(e) = move_file(file_path, dest) {
        warn!(
            file = %file_path.display(),
            dest = %dest.display(),
            error = %e,
            "Failed to move file to failed/, leaving in place"
        );
    }
}

/// Remove empty directories up to (but not including) the inbox root
fn cleanup_empty_dirs(start: Option<&Path>, base_dir: &Path) {
    let Some(mut dir) = start else { return };

    while dir != base_dir && dir.starts_with(base_dir) {
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "Removed empty directory");
        dir = match dir.parent() {
            Some(p) => p,
            None => break,
        };
    }
}

fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Collaborators;
    use crate::coordinator::test_support::Harness;
    use crate::notify::NotificationSender;

    #[test]
    fn test_is_supported_format() {
        assert!(is_supported_format(Path::new("test.pdf")));
        assert!(is_supported_format(Path::new("test.PDF")));
        assert!(is_supported_format(Path::new("test.docx")));
        assert!(is_supported_format(Path::new("test.doc")));
        assert!(is_supported_format(Path::new("test.csv")));
        assert!(is_supported_format(Path::new("test.json")));
        assert!(is_supported_format(Path::new("test.md")));
        assert!(is_supported_format(Path::new("test.txt")));

        assert!(!is_supported_format(Path::new("test.epub")));
        assert!(!is_supported_format(Path::new("test.jpg")));
        assert!(!is_supported_format(Path::new("test")));
    }

    #[test]
    fn test_inbox_file_is_staged_and_submitted() {
        let harness = Harness::new();
        let inbox = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(inbox.path().join("nested")).unwrap();
        std::fs::write(inbox.path().join("nested/notes.md"), b"# notes").unwrap();
        std::fs::write(inbox.path().join("photo.jpg"), b"jpg").unwrap();

        let handled = scan_and_process_one(&harness.coordinator, inbox.path()).unwrap();
        assert_eq!(handled.as_deref(), Some("nested/notes.md"));
        assert!(!inbox.path().join("nested").exists());
        assert!(inbox.path().join("photo.jpg").exists());

        let uploads = harness.coordinator.task_manager().get_statistics();
        assert_eq!(uploads.total_added, 1);

        assert!(
            scan_and_process_one(&harness.coordinator, inbox.path())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_staged_file_is_not_expired_by_its_inbox_age() {
        let harness = Harness::with_config(|c| c.cleanup.file_age_threshold_secs = 60);
        let inbox = tempfile::TempDir::new().unwrap();
        let source = inbox.path().join("old.txt");
        std::fs::write(&source, b"dropped long ago").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&source)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let staged = harness.temp_dir().join("staged_old.txt");
        stage_file(&source, &staged).unwrap();

        assert!(!source.exists());
        let stats = harness.coordinator.cleanup_statistics();
        assert_eq!(stats.total_temp_files, 1);
        assert_eq!(stats.cleanable_files, 0);
    }

    #[test]
    fn test_rejected_file_moves_to_failed() {
        let harness = Harness::new();
        let (notifications, _rx) = NotificationSender::channel();
        let coordinator = IngestionCoordinator::new(
            harness.coordinator.config().clone(),
            Collaborators {
                indexer: None,
                blob_store: None,
                notifications,
            },
        )
        .unwrap();
        let inbox = tempfile::TempDir::new().unwrap();
        std::fs::write(inbox.path().join("report.pdf"), b"%PDF").unwrap();

        let handled = scan_and_process_one(&coordinator, inbox.path()).unwrap();
        assert_eq!(handled.as_deref(), Some("report.pdf"));
        assert!(!inbox.path().join("report.pdf").exists());
        assert!(inbox.path().join("failed/report.pdf").exists());

        // failed/ is never rescanned
        assert!(scan_and_process_one(&coordinator, inbox.path()).unwrap().is_none());
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_poller_stops_on_cancel() {
        let harness = Harness::new();
        let inbox = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let handle = start_inbox_poller(
            harness.coordinator.clone(),
            inbox.path().to_path_buf(),
            cancel.clone(),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(inbox.path().join(FAILED_DIRECTORY).is_dir());
    }
}
