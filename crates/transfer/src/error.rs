//! Transfer error types and retry classification.

use movor_protocol::constants::STATUS_OFFSET_MISMATCH;

/// Errors produced by a [`TransferEngine`](crate::TransferEngine).
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Reading the local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server refused to create the upload resource.
    #[error("creation failed with status {status}: {message}")]
    Creation { status: u16, message: String },

    /// The server answered with an unexpected status.
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// The server's offset differs from the one the chunk was sent at.
    #[error("offset mismatch at {offset}")]
    OffsetMismatch { offset: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The upload resource no longer exists on the server.
    #[error("upload resource not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    /// The server's response violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether the operation may succeed if repeated.
    ///
    /// Network failures, timeouts, `5xx` and offset mismatches are
    /// retryable. Every other `4xx` response is final, as are local I/O
    /// errors and protocol violations.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::OffsetMismatch { .. } => true,
            Self::Creation { status, .. } | Self::Status { status, .. } => {
                status_is_retryable(*status)
            }
            Self::ChecksumMismatch
            | Self::Io(_)
            | Self::NotFound(_)
            | Self::Protocol(_)
            | Self::Cancelled => false,
        }
    }

    /// Whether the server reported an offset different from ours.
    pub fn is_offset_mismatch(&self) -> bool {
        matches!(self, Self::OffsetMismatch { .. })
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::Protocol(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Classifies an HTTP status for retry.
pub(crate) fn status_is_retryable(status: u16) -> bool {
    matches!(status, 500..=599) || status == STATUS_OFFSET_MISMATCH
}
