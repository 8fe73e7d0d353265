//! Store error types.

use std::path::PathBuf;

/// Errors produced by the [`ChunkStore`](crate::ChunkStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The storage location cannot be created or written.
    #[error("store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A read or write on an individual record failed.
    #[error("I/O error for upload {upload_id}: {source}")]
    Io {
        upload_id: String,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be decoded.
    #[error("corrupt record {upload_id}: {reason}")]
    Corrupt { upload_id: String, reason: String },

    #[error("invalid upload id: {0}")]
    InvalidId(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns `true` when the error means "record exists but is unreadable".
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
