//! Session configuration.
//!
//! Stored as JSON; every field is optional and falls back to its default,
//! so partial files written by older versions keep loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use movor_transfer::{Backoff, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::SessionError;

/// Transport and retry settings shared by every upload of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes sent per chunk request. 0 selects [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: u64,
    /// Consecutive retryable failures after which an upload fails.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Retry retryable creation failures within the same budget.
    pub retry_creation: bool,
    /// Send `Upload-Checksum` with every chunk.
    pub checksum: bool,
    /// Keep completed records in the store instead of deleting them.
    pub retain_completed: bool,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Metadata sent when creating each upload.
    pub metadata: BTreeMap<String, String>,
    /// Directory holding the upload store. Defaults to the platform data
    /// directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_root: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            backoff: Backoff::default(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            retry_creation: false,
            checksum: false,
            retain_completed: false,
            headers: BTreeMap::new(),
            metadata: BTreeMap::new(),
            storage_root: None,
        }
    }
}

impl SessionConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields the defaults. An unparsable file is logged
    /// and also yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(SessionError::Config {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse session config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn effective_chunk_size(&self) -> u64 {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Retry budget; at least one attempt is always made.
    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Storage root to open, if one is configured or can be derived.
    pub fn resolved_storage_root(&self) -> Option<PathBuf> {
        self.storage_root
            .clone()
            .or_else(movor_store::default_storage_root)
    }
}
