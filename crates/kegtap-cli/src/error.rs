use kegtap_core::BackendError;
use kegtap_flow::FlowError;
use kegtap_hardware::HardwareError;
use kegtap_storage::StorageError;
use kegtap_sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Unknown tap: {0}")]
    UnknownTap(u64),

    /// The token exists but is disabled or bound to no user.
    #[error("Token {device}/{token} cannot authenticate")]
    TokenRejected { device: String, token: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
