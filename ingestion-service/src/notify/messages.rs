//! Notification payloads.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::coordinator::UploadStatus;

/// One progress observation for an upload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub work_id: String,
    pub status: UploadStatus,
    /// 0-100, or -1 once the upload has failed
    pub progress_percentage: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Messages pushed to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Upload progress update
    UploadProgress {
        work_id: String,
        status: UploadStatus,
        progress_percentage: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        original_filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl From<StatusUpdate> for ServerMessage {
    fn from(update: StatusUpdate) -> Self {
        ServerMessage::UploadProgress {
            work_id: update.work_id,
            status: update.status,
            progress_percentage: update.progress_percentage,
            message: update.message,
            original_filename: update.original_filename,
            error_message: update.error_message,
            timestamp: update.timestamp,
        }
    }
}
