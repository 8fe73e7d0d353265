//! Upload notifications.

use movor_protocol::UploadState;
use movor_transfer::TransferError;
use tokio::sync::mpsc;

/// Receives notifications from every upload of a session.
///
/// Callbacks run on the runtime worker driving the upload. They are never
/// invoked concurrently for the same upload, but may be for different
/// uploads. Implementations must not block.
pub trait UploadObserver: Send + Sync {
    /// Called after each acknowledged chunk, and once more when the upload
    /// is paused.
    fn on_progress(&self, upload_id: &str, bytes_written: u64, bytes_total: u64);

    /// Called once when every byte has been confirmed.
    fn on_result(&self, upload_id: &str, remote_url: &str);

    /// Called once when the upload fails.
    fn on_failure(&self, upload_id: &str, error: &TransferError);

    fn on_state_change(&self, _upload_id: &str, _state: UploadState) {}
}

/// Event forwarded by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress {
        upload_id: String,
        bytes_written: u64,
        bytes_total: u64,
    },
    Completed {
        upload_id: String,
        remote_url: String,
    },
    Failed {
        upload_id: String,
        error: String,
        retryable: bool,
    },
    StateChanged {
        upload_id: String,
        state: UploadState,
    },
}

impl UploadEvent {
    pub fn upload_id(&self) -> &str {
        match self {
            Self::Progress { upload_id, .. }
            | Self::Completed { upload_id, .. }
            | Self::Failed { upload_id, .. }
            | Self::StateChanged { upload_id, .. } => upload_id,
        }
    }
}

/// Forwards notifications into an unbounded channel.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<UploadEvent>) -> Self {
        Self { tx }
    }

    /// Creates an observer together with its event receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl UploadObserver for ChannelObserver {
    fn on_progress(&self, upload_id: &str, bytes_written: u64, bytes_total: u64) {
        let _ = self.tx.send(UploadEvent::Progress {
            upload_id: upload_id.to_string(),
            bytes_written,
            bytes_total,
        });
    }

    fn on_result(&self, upload_id: &str, remote_url: &str) {
        let _ = self.tx.send(UploadEvent::Completed {
            upload_id: upload_id.to_string(),
            remote_url: remote_url.to_string(),
        });
    }

    fn on_failure(&self, upload_id: &str, error: &TransferError) {
        let _ = self.tx.send(UploadEvent::Failed {
            upload_id: upload_id.to_string(),
            error: error.to_string(),
            retryable: error.is_retryable(),
        });
    }

    fn on_state_change(&self, upload_id: &str, state: UploadState) {
        let _ = self.tx.send(UploadEvent::StateChanged {
            upload_id: upload_id.to_string(),
            state,
        });
    }
}
