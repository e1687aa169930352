//! Test doubles and a coordinator harness shared by the coordinator tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::{Collaborators, IngestionCoordinator, UploadStatus};
use crate::catalog::MetadataRow;
use crate::collaborators::{BlobStore, ContentIndexer, IndexProgress};
use crate::config::AppConfig;
use crate::error::{IndexerError, StorageError};
use crate::notify::{NotificationSender, StatusUpdate};

const WAIT: Duration = Duration::from_secs(10);

/// In-memory blob store that can be told to fail selected uploads
#[derive(Default)]
pub(crate) struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Bytes>>,
    fail_suffix: Mutex<Option<String>>,
}

impl MemoryBlobStore {
    pub(crate) fn fail_uploads_matching(&self, suffix: &str) {
        *self.fail_suffix.lock().unwrap() = Some(suffix.to_string());
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload_bytes(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        if let Some(suffix) = self.fail_suffix.lock().unwrap().as_deref()
            && name.ends_with(suffix)
        {
            return Err(StorageError::Unavailable {
                message: format!("upload of {} refused", name),
            });
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn download_bytes(&self, name: &str) -> Result<Bytes, StorageError> {
        self.blobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                name: name.to_string(),
            })
    }

    fn list_blobs(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.blobs.lock().unwrap().keys().cloned().collect())
    }

    fn blob_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.lock().unwrap().contains_key(name))
    }

    fn delete_blob(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.lock().unwrap().remove(name).is_some())
    }

    fn uri_for(&self, name: &str) -> String {
        format!("memory://{}", name)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// How a [`RecordingIndexer`] misbehaves after reporting its first progress
#[derive(Debug, Clone)]
pub(crate) enum IndexerFault {
    Error(String),
    Panic(String),
}

/// Indexer that reports 0/50/100 and records what it was given
#[derive(Default)]
pub(crate) struct RecordingIndexer {
    calls: AtomicUsize,
    fault: Option<IndexerFault>,
    last_metadata_len: Mutex<Option<usize>>,
}

impl RecordingIndexer {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_metadata_len(&self) -> Option<usize> {
        *self.last_metadata_len.lock().unwrap()
    }
}

impl ContentIndexer for RecordingIndexer {
    fn process(
        &self,
        file_path: &Path,
        filename: &str,
        metadata: Option<&MetadataRow>,
        progress: IndexProgress<'_>,
    ) -> Result<bool, IndexerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_metadata_len.lock().unwrap() = metadata.map(|m| m.len());

        progress(0, "Extracting text");
        std::fs::read(file_path).map_err(|source| IndexerError::Read {
            path: file_path.to_path_buf(),
            source,
        })?;
        match &self.fault {
            Some(IndexerFault::Error(message)) => {
                return Err(IndexerError::Rejected {
                    filename: filename.to_string(),
                    message: message.clone(),
                });
            }
            Some(IndexerFault::Panic(message)) => panic!("{}", message),
            None => {}
        }
        progress(50, "Generating embeddings");
        progress(100, "Uploaded to search index");
        Ok(true)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// A coordinator over temp directories with in-memory collaborators
pub(crate) struct Harness {
    pub(crate) coordinator: Arc<IngestionCoordinator>,
    pub(crate) store: Arc<MemoryBlobStore>,
    pub(crate) indexer: Arc<RecordingIndexer>,
    updates: mpsc::UnboundedReceiver<StatusUpdate>,
    seen: Vec<StatusUpdate>,
    _dir: TempDir,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::build(None, |_| {})
    }

    pub(crate) fn with_failing_indexer(message: &str) -> Self {
        Self::build(Some(IndexerFault::Error(message.to_string())), |_| {})
    }

    pub(crate) fn with_panicking_indexer(message: &str) -> Self {
        Self::build(Some(IndexerFault::Panic(message.to_string())), |_| {})
    }

    pub(crate) fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(None, configure)
    }

    fn build(fault: Option<IndexerFault>, configure: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.storage.temp_dir = dir.path().join("temp_uploads");
        config.storage.blob_dir = dir.path().join("blobs");
        config.processing.default_bot_id = "default".to_string();
        config.processing.shutdown_timeout_secs = 10;
        configure(&mut config);
        std::fs::create_dir_all(&config.storage.temp_dir).unwrap();

        let store = Arc::new(MemoryBlobStore::default());
        let indexer = Arc::new(RecordingIndexer {
            fault,
            ..RecordingIndexer::default()
        });
        let (notifications, updates) = NotificationSender::channel();

        let coordinator = IngestionCoordinator::new(
            config,
            Collaborators {
                indexer: Some(indexer.clone()),
                blob_store: Some(store.clone()),
                notifications,
            },
        )
        .unwrap();

        Self {
            coordinator,
            store,
            indexer,
            updates,
            seen: Vec::new(),
            _dir: dir,
        }
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.coordinator.config().storage.temp_dir.clone()
    }

    /// Write an upload into the temp directory
    pub(crate) fn stage(&self, filename: &str, content: &[u8]) -> PathBuf {
        let path = self.temp_dir().join(format!("{}-{}", uuid::Uuid::new_v4(), filename));
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Stage and submit an upload, returning its work id
    pub(crate) fn submit(&self, filename: &str, content: &[u8], bot_id: Option<&str>) -> String {
        let path = self.stage(filename, content);
        self.coordinator
            .create_upload_record(filename, path, content.len() as u64, bot_id)
            .unwrap()
    }

    /// Block until the completion notification for `work_id` arrives.
    ///
    /// Returns every update seen for that upload, in order.
    pub(crate) fn wait_for_final(&mut self, work_id: &str) -> Vec<StatusUpdate> {
        let deadline = Instant::now() + WAIT;
        while !self.seen.iter().any(|u| u.work_id == work_id && is_final(u)) {
            match self.updates.try_recv() {
                Ok(update) => self.seen.push(update),
                Err(_) => {
                    assert!(Instant::now() < deadline, "no final update for {}", work_id);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        self.seen
            .iter()
            .filter(|u| u.work_id == work_id)
            .cloned()
            .collect()
    }

    /// Wait for every upload to finish, including any merge its completion triggered
    pub(crate) fn wait_all(&mut self, work_ids: &[String]) {
        for work_id in work_ids {
            self.wait_for_final(work_id);
        }
    }
}

/// The completion hook's update: the task has reached a terminal state
fn is_final(update: &StatusUpdate) -> bool {
    match update.status {
        UploadStatus::Completed => true,
        UploadStatus::Failed => update.error_message.is_some(),
        UploadStatus::Queued | UploadStatus::Processing => false,
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.coordinator.stop();
    }
}
