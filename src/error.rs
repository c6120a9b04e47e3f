// ===============================
// src/error.rs
// ===============================
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity-class failure: busy/locked database, I/O, cannot open.
    #[error("store unavailable: {0}")]
    Transient(String),
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
    /// Transient failures outlasted the retry policy; the operator was alerted.
    #[error("{op} gave up after {attempts} attempts: {last}")]
    Exhausted { op: String, attempts: u32, last: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, StoreError::Exhausted { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _)
                if matches!(
                    f.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                ) =>
            {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network: {0}")]
    Network(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("decode: {0}")]
    Decode(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl FeedError {
    /// Network-level failures are retried; decode errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Network(_) | FeedError::Status(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            FeedError::Status(status.as_u16())
        } else {
            FeedError::Network(e.to_string())
        }
    }
}

/// Failure of a single scheduled firing; never escapes the firing task.
#[derive(Debug, Error)]
pub enum FireError {
    #[error("market data: {0}")]
    Feed(#[from] FeedError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}
