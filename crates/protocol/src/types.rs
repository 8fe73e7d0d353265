use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single upload.
///
/// `Completed` and `Cancelled` are terminal. `Failed` is not: a manual
/// resume may re-enter `Creating` or `Uploading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Creating,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    /// Returns `true` for states no transition can leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` while a task is driving the transfer.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Pending | Self::Creating | Self::Uploading)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Completed | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, Creating | Paused) => true,
            (Creating, Uploading | Failed | Paused) => true,
            (Uploading, Completed | Failed | Paused) => true,
            (Paused, Creating | Uploading) => true,
            (Failed, Creating | Uploading) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Whether a session currently accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Active,
}

/// Violations of the [`UploadRecord`] invariants.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: UploadState, to: UploadState },

    #[error("remote resource URL already assigned")]
    ResourceAlreadyAssigned,

    #[error("offset {offset} exceeds total size {total}")]
    OffsetOutOfRange { offset: u64, total: u64 },
}

/// Durable description of one upload.
///
/// Invariants: `bytes_confirmed <= total_bytes`, and `remote_resource_url`
/// is assigned at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: String,
    pub local_file_path: PathBuf,
    pub remote_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_resource_url: Option<String>,
    pub total_bytes: u64,
    bytes_confirmed: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub retry_count: u32,
    state: UploadState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Creates a new record in [`UploadState::Pending`].
    pub fn new(
        upload_id: impl Into<String>,
        local_file_path: impl Into<PathBuf>,
        remote_endpoint: impl Into<String>,
        total_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.into(),
            local_file_path: local_file_path.into(),
            remote_endpoint: remote_endpoint.into(),
            remote_resource_url: None,
            total_bytes,
            bytes_confirmed: 0,
            headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
            retry_count: 0,
            state: UploadState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_confirmed(&self) -> u64 {
        self.bytes_confirmed
    }

    pub fn remote_resource_url(&self) -> Option<&str> {
        self.remote_resource_url.as_deref()
    }

    /// Returns `true` once every byte has been acknowledged.
    pub fn is_fully_confirmed(&self) -> bool {
        self.bytes_confirmed == self.total_bytes
    }

    /// Fraction of the file acknowledged by the server, in `[0.0, 1.0]`.
    ///
    /// An empty file counts as fully transferred.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.bytes_confirmed as f64 / self.total_bytes as f64
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: UploadState) -> Result<(), RecordError> {
        if !self.state.can_transition_to(next) {
            return Err(RecordError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Assigns the resource URL returned by the creation handshake.
    pub fn assign_resource_url(&mut self, url: impl Into<String>) -> Result<(), RecordError> {
        if self.remote_resource_url.is_some() {
            return Err(RecordError::ResourceAlreadyAssigned);
        }
        self.remote_resource_url = Some(url.into());
        self.touch();
        Ok(())
    }

    /// Records the offset acknowledged by the server.
    ///
    /// The offset may move backwards when the server reports less than was
    /// recorded locally; the server is authoritative.
    pub fn confirm_offset(&mut self, offset: u64) -> Result<(), RecordError> {
        if offset > self.total_bytes {
            return Err(RecordError::OffsetOutOfRange {
                offset,
                total: self.total_bytes,
            });
        }
        self.bytes_confirmed = offset;
        self.touch();
        Ok(())
    }

    /// Normalizes a record loaded from disk after an unclean stop.
    ///
    /// Records persisted while a task was mid-flight come back as `Paused`
    /// (or `Pending` when creation never finished).
    pub fn restore(mut self) -> Self {
        if matches!(self.state, UploadState::Creating | UploadState::Uploading) {
            self.state = if self.remote_resource_url.is_some() {
                UploadState::Paused
            } else {
                UploadState::Pending
            };
        }
        self
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
