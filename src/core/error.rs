use std::time::Duration;
use thiserror::Error;

/// Failures reported by a document store connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Request rate is large: {0}")]
    RequestRateTooLarge(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Invalid object id: '{0}'")]
    InvalidId(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the store is asking the caller to slow down and try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::TooManyRequests(_) | StoreError::RequestRateTooLarge(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the generic collection layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },

    #[error("Retry deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid client id")]
    InvalidClientId,
}

pub type Result<T> = std::result::Result<T, DatabaseError>;
