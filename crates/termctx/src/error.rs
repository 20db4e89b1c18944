//! Error types for stores, the backend boundary, the wire protocol, and the
//! daemon lifecycle.
//!
//! Most failures inside the daemon are recovered locally (see the policy
//! notes on each variant); only [`DaemonError`] at startup is fatal.

use std::path::PathBuf;

/// Failure to persist a store to disk.
///
/// Store mutations log and swallow these: persisted facts are advisory and
/// the in-memory state remains authoritative until the next successful write.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`Backend`](crate::backend::Backend).
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Transport or HTTP-level failure (after retries were exhausted).
    #[error("backend request failed: {0}")]
    Request(String),
    /// The backend answered but the payload was unusable.
    #[error("backend returned an unusable response: {0}")]
    Malformed(String),
}

/// A client frame that could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty frame")]
    Empty,
}

/// Fatal daemon startup and serving errors.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("another daemon is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
