//! Unified error handling for the sync engine.
//!
//! Two layers:
//! - [`SyncErrorKind`] is the closed taxonomy every pipeline failure is reported
//!   with. It is `Copy`, serializable, and is what the host UI displays.
//! - [`GeoSyncError`] is the crate error returned by fallible setup and storage
//!   calls. It wraps a [`SyncErrorKind`] where one applies and adds the
//!   infrastructure failures (configuration, closed store, stopped engine).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy surfaced by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "code")]
pub enum SyncErrorKind {
    /// Location permission has not been granted.
    #[error("location permission denied")]
    PermissionDenied,
    /// The location provider could not be reached within the retry window.
    #[error("location provider unavailable")]
    ProviderUnavailable,
    /// A location fix or network request did not complete in time.
    #[error("timed out")]
    Timeout,
    /// The request never reached the remote endpoint.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// The endpoint answered with a non-success status.
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    /// The response body was not a valid record.
    #[error("response could not be decoded")]
    DecodeFailure,
    /// The local store rejected the write.
    #[error("local storage full")]
    StorageFull,
    /// A stored entry could not be decoded.
    #[error("stored entry is corrupted")]
    CorruptedEntry,
}

impl SyncErrorKind {
    /// Whether the network fetcher retries this error automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncErrorKind::Timeout | SyncErrorKind::NetworkUnreachable)
    }
}

/// Crate error type.
#[derive(Debug, Error)]
pub enum GeoSyncError {
    /// A pipeline failure from the taxonomy.
    #[error(transparent)]
    Sync(#[from] SyncErrorKind),
    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config { message: String },
    /// Storage failure outside the taxonomy (I/O, schema, SQL).
    #[error("storage error: {message}")]
    Storage { message: String },
    /// The store was closed when the pipeline stopped.
    #[error("store is closed")]
    StoreClosed,
    /// The HTTP client could not be built.
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
    /// `start()` was called on a running location source.
    #[error("location source is already running")]
    AlreadyRunning,
    /// The engine has terminated; signals are no longer accepted.
    #[error("sync engine has stopped")]
    EngineStopped,
}

impl GeoSyncError {
    /// Project onto the taxonomy.
    ///
    /// Storage failures outside the taxonomy are reported as
    /// [`SyncErrorKind::StorageFull`]: like a full disk, they reject this one
    /// write and leave the pipeline running.
    pub fn kind(&self) -> Option<SyncErrorKind> {
        match self {
            GeoSyncError::Sync(kind) => Some(*kind),
            GeoSyncError::Storage { .. } | GeoSyncError::StoreClosed => {
                Some(SyncErrorKind::StorageFull)
            }
            _ => None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        GeoSyncError::Config {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for GeoSyncError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match e.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => GeoSyncError::Sync(SyncErrorKind::StorageFull),
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                GeoSyncError::Sync(SyncErrorKind::CorruptedEntry)
            }
            _ => GeoSyncError::Storage {
                message: e.to_string(),
            },
        }
    }
}

impl From<rusqlite_migration::Error> for GeoSyncError {
    fn from(e: rusqlite_migration::Error) -> Self {
        GeoSyncError::Storage {
            message: format!("migration failed: {}", e),
        }
    }
}

/// Result type alias for geosync operations.
pub type Result<T> = std::result::Result<T, GeoSyncError>;
