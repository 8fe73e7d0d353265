//! Session error types.

use std::path::PathBuf;

use movor_protocol::UploadState;

/// Errors returned synchronously by [`Session`](crate::Session) calls.
///
/// Failures of an individual upload never appear here; they reach the
/// caller through [`UploadObserver::on_failure`](crate::UploadObserver).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The upload store could not be opened. The session stays stopped.
    #[error("upload store unavailable: {0}")]
    StoreUnavailable(String),

    /// A new upload could not be created.
    #[error("cannot create upload task: {0}")]
    TaskCreation(String),

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("session is not active")]
    NotActive,

    #[error("session is already active")]
    AlreadyActive,

    #[error("unknown upload {0}")]
    UnknownUpload(String),

    /// The upload's state does not allow the requested operation.
    #[error("upload {upload_id} is {state}")]
    InvalidState {
        upload_id: String,
        state: UploadState,
    },

    #[error("cannot read config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] movor_store::StoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] movor_transfer::TransferError),
}
