use thiserror::Error;

/// Errors raised by the durable queue.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A payload could not be serialized or parsed back
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored row carries a record type this build does not know
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("Invalid queue configuration: {0}")]
    Configuration(String),
}

impl StorageError {
    /// The row itself is unusable; retrying will never help.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            StorageError::Payload(_) | StorageError::UnknownRecordType(_)
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
