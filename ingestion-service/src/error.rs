use std::path::PathBuf;

use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Upload not found: {work_id}")]
    UploadNotFound { work_id: String },

    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    #[error("Failed to update file catalog for {filename}")]
    CatalogUpdate {
        filename: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to merge worker file lists for bot {bot_id}")]
    Merge {
        bot_id: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to clean up {}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Service not initialized: {message}")]
    Initialization { message: String },

    #[error("Metadata error: {message}")]
    Metadata { message: String },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Indexing failed")]
    Indexer(#[from] IndexerError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Task manager is shut down")]
    ShutDown,
}

/// Blob storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {name}")]
    NotFound { name: String },

    #[error("Storage I/O failed for {name}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid blob name: {name}")]
    InvalidName { name: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error("Storage backend unavailable: {message}")]
    Unavailable { message: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Content indexer errors
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Indexer not ready: {message}")]
    NotReady { message: String },

    #[error("Failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Indexing rejected {filename}: {message}")]
    Rejected { filename: String, message: String },

    #[error("Failed to upload indexed content")]
    Upload(#[source] StorageError),
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("No subscribers for {work_id}")]
    NoSubscribers { work_id: String },

    #[error("Notification channel closed")]
    Closed,

    #[error("Delivery failed: {message}")]
    Delivery { message: String },
}

/// Error returned by a task function
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{}", format_error_chain(.0))]
    Service(#[from] ServiceError),

    #[error("{message}")]
    Failed { message: String },

    #[error("Task panicked: {message}")]
    Panicked { message: String },
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error followed by its `source()` chain, joined with ": ".
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_error_chain_includes_sources() {
        let error = ServiceError::CatalogUpdate {
            filename: "report.pdf".to_string(),
            source: StorageError::Io {
                name: "bot-filelist.json".to_string(),
                source: std::io::Error::other("disk full"),
            },
        };

        assert_eq!(
            format_error_chain(&error),
            "Failed to update file catalog for report.pdf: \
             Storage I/O failed for bot-filelist.json: disk full"
        );
    }

    #[test]
    fn test_task_error_from_service_error_keeps_chain() {
        let error: TaskError = ServiceError::Indexer(IndexerError::Rejected {
            filename: "a.pdf".to_string(),
            message: "empty document".to_string(),
        })
        .into();

        assert_eq!(
            error.to_string(),
            "Indexing failed: Indexing rejected a.pdf: empty document"
        );
    }

    #[test]
    fn test_not_found_detection() {
        assert!(StorageError::NotFound { name: "x".into() }.is_not_found());
        assert!(!StorageError::InvalidName { name: "x".into() }.is_not_found());
    }
}
