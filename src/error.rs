//! Named failure kinds callers can match on, alongside the `anyhow::Result`
//! used everywhere else for plumbing (sqlite, I/O, serialization).

use thiserror::Error;

use crate::uid::Uid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cache for device {device_uid} is not loaded")]
    CacheNotLoaded { device_uid: Uid },

    #[error("no cache registered for device {device_uid}")]
    CacheNotFound { device_uid: Uid },

    #[error("no node present for uid {uid}")]
    NodeNotPresent { uid: Uid },

    #[error("op graph insert is invalid: {reason}")]
    InvalidInsertOpGraph { reason: String },

    #[error("batch insert failed and was rolled back: {reason}")]
    UnsuccessfulBatchInsert { reason: String },

    #[error("identity mapping conflict for key {key}")]
    MappingConflict { key: String },

    #[error("result set exceeded the configured limit of {limit}")]
    ResultsExceeded { limit: usize },

    #[error("backend I/O failure: {0}")]
    Backend(#[from] std::io::Error),
}
