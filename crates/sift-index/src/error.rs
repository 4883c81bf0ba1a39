//! Error types for index, shard and upgrade operations.

use sift_common::NameError;
use sift_meta_store::MetaStoreError;

/// Result type for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

/// Error type for index operations
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("index already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid shard count {0}: must be between 1 and 1024")]
    InvalidShardCount(u32),

    #[error("invalid index name: {0}")]
    InvalidName(#[from] NameError),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("shard {0} is closed")]
    ShardClosed(u32),

    #[error("shard {shard} stopped after a failed commit: {reason}")]
    ShardFailed { shard: String, reason: String },

    #[error("shard {0} queue is full")]
    QueueFull(u32),

    #[error("{} of {} deletes failed", .failed_ids.len(), .failed_ids.len() + .deleted)]
    PartialFailure {
        failed_ids: Vec<String>,
        deleted: usize,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unsupported on-disk version: {0}")]
    UnsupportedVersion(String),

    #[error("migration {from} -> {to} failed: {reason}")]
    Migration {
        from: String,
        to: String,
        reason: String,
    },

    #[error("index {index} is unavailable: {reason}")]
    Unavailable { index: String, reason: String },

    #[error("write-ahead log error: {0}")]
    Wal(#[source] sift_common::Error),

    #[error("segment error: {0}")]
    Segment(#[from] redb::Error),

    #[error("metadata store error: {0}")]
    Meta(#[from] MetaStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to close {} indices", .0.len())]
    CloseFailed(Vec<(String, IndexError)>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for IndexError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("worker task failed: {e}"))
    }
}

impl IndexError {
    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Backpressure and timeouts may succeed on retry; metadata errors only
    /// when the store says so.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::QueueFull(_) | Self::Timeout(_) => true,
            Self::Meta(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a not-found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Meta(e) => e.is_not_found(),
            _ => false,
        }
    }
}
