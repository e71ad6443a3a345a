use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for build-hook operations
pub type Result<T, E = BuildHookError> = std::result::Result<T, E>;

/// Errors that stop the service itself. Per-request failures are turned into
/// responses and never surface here.
#[derive(Error, Debug)]
pub enum BuildHookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store setup error: {0}")]
    Store(#[from] StoreError),
}
