//! Error taxonomy shared by every metadata backend.

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("metadata store is closed")]
    Closed,
    #[error("metadata request timed out")]
    Timeout,
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    #[error("metadata backend error: {0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<sift_common::Error> for MetaStoreError {
    fn from(e: sift_common::Error) -> Self {
        match e {
            sift_common::Error::Configuration(msg) => Self::Configuration(msg),
            sift_common::Error::Io(e) => Self::Io(e),
            sift_common::Error::Timeout => Self::Timeout,
            sift_common::Error::Corrupt(msg) => Self::Corrupt(msg),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl MetaStoreError {
    /// Check if this is a missing-key error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }

    /// Timeouts and unreachable coordination stores may succeed on retry.
    /// Callers retry only idempotent reads.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }

    /// Failures of the underlying medium (disk or network)
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Timeout
                | Self::Unavailable(_)
                | Self::Redb(_)
                | Self::Storage(_)
                | Self::Commit(_)
        )
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

pub(crate) fn check_key(key: &str) -> MetaStoreResult<()> {
    if key.is_empty() {
        return Err(MetaStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
