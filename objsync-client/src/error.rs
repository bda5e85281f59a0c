use objsync_core::OperationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The client task is no longer running.
    #[error("sync client stopped")]
    Stopped,
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("invalid client configuration: {0}")]
    Config(#[from] serde_json::Error),
}
