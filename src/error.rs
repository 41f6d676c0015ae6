//! Error types for the feed generator.

use crate::types::JobId;
use thiserror::Error;

/// Main error type for feed generator operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed stream event: {0}")]
    Decode(String),

    #[error("Failed to enqueue job on {queue}: {reason}")]
    Enqueue { queue: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Job {job_id} on {queue} failed permanently after {attempts} attempts")]
    PermanentJobFailure {
        queue: String,
        job_id: JobId,
        attempts: u32,
    },

    #[error("Lease for job {job_id} on {queue} is no longer held")]
    StaleLease { queue: String, job_id: JobId },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(usize),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedFeed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl FeedError {
    /// Whether a worker should hand the job back to its queue for another try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::Io(_) | FeedError::StoreUnavailable(_) | FeedError::Locked
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Decode(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

impl From<toml::de::Error> for FeedError {
    fn from(e: toml::de::Error) -> Self {
        FeedError::Config(e.to_string())
    }
}

/// Result type for feed generator operations.
pub type Result<T> = std::result::Result<T, FeedError>;
