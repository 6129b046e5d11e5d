//! Cross-process coordination over the filesystem.
//!
//! Independent invocations (local runs, CI jobs, retried hooks) share no
//! memory; the only things they agree through are marker-file locks and
//! atomically-replaced state files. This module is that agreement layer:
//! [`LockManager`] for exclusive, timeout-bounded locks and [`ContextStore`]
//! for atomic writes with content-hash preconditions.

mod lock;
mod store;

pub use lock::{LockHandle, LockManager, LockMarker};
pub use store::ContextStore;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Resource stayed contended beyond the caller's timeout. Retryable.
    #[error("timed out acquiring lock on '{resource}' after {waited_ms}ms")]
    LockTimeout { resource: String, waited_ms: u64 },

    /// Precondition hash no longer matches the stored content. The caller
    /// must re-read and reconcile; blind retry would overwrite someone
    /// else's write.
    #[error("integrity violation on '{path}': expected hash {expected}, found {actual}")]
    IntegrityViolation {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("lock marker at '{path}' is unreadable: {reason}")]
    CorruptMarker { path: PathBuf, reason: String },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
