//! Background upload ingestion: a task queue with worker threads, per-upload
//! progress notifications, per-bot file catalogs and temp-file cleanup.

pub mod auto_import;
pub mod catalog;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod indexer;
pub mod notify;
pub mod storage;
pub mod tasks;
