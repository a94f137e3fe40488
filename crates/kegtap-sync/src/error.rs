use kegtap_core::BackendError;
use kegtap_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Queue error: {0}")]
    Storage(#[from] StorageError),

    /// The sync task has been stopped and accepts no more records.
    #[error("Sync manager stopped")]
    Stopped,
}

impl SyncError {
    /// Failures that should surface as "backend unreachable".
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Backend(e) if !e.is_permanent())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
