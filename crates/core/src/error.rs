//! Unified error types for casefeed.
//!
//! Each variant displays as `CODE: message`; the code is what the UI sees in
//! `SyncProgress.error`.

use tokio_rusqlite::rusqlite;

/// Unified error types for the sync and cache layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A remote subscription failed to open or its stream failed.
    #[error("CONNECTION_ERROR: {0}")]
    Connection(String),

    /// An on-demand search received no data within its window.
    #[error("TIMEOUT: {0}")]
    Timeout(String),

    /// A change message could not be coerced or applied to the local store.
    #[error("APPLY_ERROR: {0}")]
    Apply(String),

    /// Invalid input parameters.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Closing a subscription failed.
    #[error("DISPOSE_ERROR: {0}")]
    Dispose(String),

    /// Database operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// A stored record body could not be encoded or decoded.
    #[error("STORE_ERROR: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable code string for this error, as surfaced to the UI.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Apply(_) => "APPLY_ERROR",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Dispose(_) => "DISPOSE_ERROR",
            Error::Database(_) | Error::MigrationFailed(_) | Error::Serialization(_) => "STORE_ERROR",
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}
