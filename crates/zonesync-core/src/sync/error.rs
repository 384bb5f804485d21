//! Sync error types

use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the remote zone service
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The server rejected the request as invalid; never retried
    #[error("Server rejected request (400): {body}")]
    Validation { body: String },

    /// Non-success status after every retry
    #[error("Server returned HTTP {status}")]
    Status { status: u16 },

    /// Connection, timeout or body transfer failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not have the expected shape
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    /// No server URL configured
    #[error("Sync server URL is not configured")]
    NotConfigured,
}

impl RemoteError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Status { .. } | RemoteError::Transport(_))
    }
}

/// Errors that abort a sync cycle
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync is disabled or not configured")]
    Disabled,

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
