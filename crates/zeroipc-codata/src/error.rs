//! Error type for codata operations.

use thiserror::Error;
use zeroipc::Error as IpcError;

/// Convenience alias used throughout the crate.
pub type Result<T, E = CodataError> = std::result::Result<T, E>;

/// Errors from futures, lazy values, channels and streams.
#[derive(Debug, Error)]
pub enum CodataError {
    /// Failure from the underlying segment or container.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// A producer completed a future with an error message.
    #[error("computation failed: {0}")]
    Failed(String),
}

impl CodataError {
    /// Returns `true` if this is a retryable backpressure condition.
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Ipc(IpcError::Full | IpcError::Empty))
    }

    /// Returns `true` if a time-bounded operation expired.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Ipc(IpcError::Timeout))
    }

    /// Returns `true` if the endpoint is permanently unusable.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Ipc(IpcError::Closed))
    }
}
