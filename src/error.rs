use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// StorageError — durable key-value store failures
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt value under key \"{key}\"")]
    Corruption {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// StoreError — remote document-store failures
// ---------------------------------------------------------------------------

/// Classification of a remote store failure.
///
/// The engine treats both kinds identically — retry happens only via the next
/// natural trigger, and the offline-mode flag is how the host tells this layer
/// to stop trying. The kind is carried for the host's benefit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Network error, rate limit, temporary outage.
    Transient,
    /// The store is reachable but rejects the write.
    Permission,
}

/// Error surfaced by a [`MatchStore`](crate::sync::MatchStore) implementation.
#[derive(Debug, Clone)]
pub struct StoreError {
    pub message: String,
    pub kind: StoreErrorKind,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StoreErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: StoreErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// SyncError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Convenience alias — the default error type is `SyncError`.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
