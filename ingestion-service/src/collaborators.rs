//! Interfaces to the services the coordinator drives.
//!
//! Every method is synchronous: callers are worker threads, not async tasks.

use std::path::Path;

use bytes::Bytes;

use crate::catalog::MetadataRow;
use crate::error::{IndexerError, NotifyError, StorageError};
use crate::notify::StatusUpdate;

/// Progress sink handed to a [`ContentIndexer`]: percentage (0-100) and message
pub type IndexProgress<'a> = &'a dyn Fn(i32, &str);

/// Extracts, embeds and publishes the content of one file.
pub trait ContentIndexer: Send + Sync {
    /// Process a staged upload.
    ///
    /// Reports its own 0-100 progress through `progress`. Returns `Ok(false)`
    /// when the file was handled but produced no usable content.
    fn process(
        &self,
        file_path: &Path,
        filename: &str,
        metadata: Option<&MetadataRow>,
        progress: IndexProgress<'_>,
    ) -> Result<bool, IndexerError>;

    /// Verify backing services are reachable.
    fn check_ready(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    /// Human-readable name for health reports
    fn name(&self) -> &str;
}

/// Named-blob storage backing catalogs and uploaded files.
pub trait BlobStore: Send + Sync {
    fn upload_bytes(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Returns [`StorageError::NotFound`] when the blob is absent.
    fn download_bytes(&self, name: &str) -> Result<Bytes, StorageError>;

    fn list_blobs(&self) -> Result<Vec<String>, StorageError>;

    fn blob_exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Returns false when there was nothing to delete.
    fn delete_blob(&self, name: &str) -> Result<bool, StorageError>;

    /// Public URI recorded in catalog entries
    fn uri_for(&self, name: &str) -> String;

    fn check_health(&self) -> Result<(), StorageError> {
        self.list_blobs().map(|_| ())
    }

    fn name(&self) -> &str;
}

/// Push transport for upload status updates.
pub trait NotificationChannel: Send + Sync {
    fn broadcast(&self, work_id: &str, update: &StatusUpdate) -> Result<(), NotifyError>;
}
