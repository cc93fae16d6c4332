use std::io;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure taxonomy shared by every engine operation.
///
/// Each kind maps onto one caller recovery strategy: re-authenticate, retry
/// with backoff, abort the sync cycle, or wait out the lease.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend rejected the credentials (HTTP 401). Never retried
    /// internally; the caller refreshes credentials and restarts the sync.
    #[error("authorization expired")]
    AuthExpired,
    /// Transport-level failure, stream error, or a non-2xx response not
    /// otherwise classified. Safe to retry with backoff.
    #[error("network failure: {0}")]
    Network(String),
    /// Protocol anomaly: malformed multistatus, missing expected property,
    /// unparsable timestamp. Aborts the current sync cycle only.
    #[error("unexpected server behavior: {0}")]
    Unexpected(String),
    /// Another device holds the lease; retry after the given delay.
    #[error("lock already held, retry in {retry_after_ms} ms")]
    LockAlreadyHeld { retry_after_ms: u64 },
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::LockAlreadyHeld { .. }
        )
    }

    /// Delay hint carried by [`SyncError::LockAlreadyHeld`].
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SyncError::LockAlreadyHeld { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            return SyncError::AuthExpired;
        }
        SyncError::Network(format!("server returned {status}: {body}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(StatusCode::UNAUTHORIZED) {
            return SyncError::AuthExpired;
        }
        SyncError::Network(err.to_string())
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Network(format!("I/O error: {err}"))
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::Unexpected(format!("invalid url: {err}"))
    }
}
