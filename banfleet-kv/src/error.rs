use thiserror::Error;

/// Result type for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors surfaced by the etcd access layer.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists")]
    KeyExists,

    #[error("page size must be greater than 0")]
    InvalidPageSize,

    #[error("lease duration must be at least 1 second")]
    LeaseTooShort,

    #[error("lease {0} not found")]
    LeaseNotFound(i64),

    #[error("watch closed: {0}")]
    WatchClosed(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl KvError {
    /// True when the error is the typed not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::KeyNotFound)
    }
}
