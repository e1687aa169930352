//! Content indexer that publishes uploads to the blob store unchanged.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::MetadataRow;
use crate::collaborators::{BlobStore, ContentIndexer, IndexProgress};
use crate::error::IndexerError;

/// Stores the raw upload under its original filename.
pub struct BlobUploadIndexer {
    store: Arc<dyn BlobStore>,
}

impl BlobUploadIndexer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }
}

impl ContentIndexer for BlobUploadIndexer {
    fn process(
        &self,
        file_path: &Path,
        filename: &str,
        metadata: Option<&MetadataRow>,
        progress: IndexProgress<'_>,
    ) -> Result<bool, IndexerError> {
        progress(0, "Reading file");
        let content = std::fs::read(file_path).map_err(|source| IndexerError::Read {
            path: file_path.to_path_buf(),
            source,
        })?;

        if content.is_empty() {
            return Err(IndexerError::Rejected {
                filename: filename.to_string(),
                message: "file is empty".to_string(),
            });
        }

        debug!(
            filename = %filename,
            bytes = content.len(),
            metadata_fields = metadata.map_or(0, |m| m.len()),
            "Publishing upload content"
        );

        progress(50, "Uploading content");
        self.store
            .upload_bytes(filename, &content)
            .map_err(IndexerError::Upload)?;

        progress(100, "Content stored");
        Ok(true)
    }

    fn check_ready(&self) -> Result<(), IndexerError> {
        self.store
            .check_health()
            .map_err(|e| IndexerError::NotReady {
                message: format!("{} blob store unavailable: {}", self.store.name(), e),
            })
    }

    fn name(&self) -> &str {
        "blob-upload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_process_stores_file_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalBlobStore::open(dir.path().join("blobs")).unwrap());
        let indexer = BlobUploadIndexer::new(store.clone());

        let upload = dir.path().join("staged.bin");
        std::fs::write(&upload, b"hello").unwrap();

        let seen = Mutex::new(Vec::new());
        let processed = indexer
            .process(&upload, "notes.txt", None, &|pct, _msg| {
                seen.lock().unwrap().push(pct)
            })
            .unwrap();

        assert!(processed);
        assert_eq!(*seen.lock().unwrap(), vec![0, 50, 100]);
        assert_eq!(&store.download_bytes("notes.txt").unwrap()[..], b"hello");
        assert!(indexer.check_ready().is_ok());
    }

    #[test]
    fn test_missing_and_empty_files_fail() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalBlobStore::open(dir.path().join("blobs")).unwrap());
        let indexer = BlobUploadIndexer::new(store);

        let missing = indexer.process(&dir.path().join("nope"), "nope.pdf", None, &|_, _| {});
        assert!(matches!(missing, Err(IndexerError::Read { .. })));

        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();
        let rejected = indexer.process(&empty, "empty.pdf", None, &|_, _| {});
        assert!(matches!(rejected, Err(IndexerError::Rejected { .. })));
    }
}
