use std::path::{Component, Path, PathBuf};

use crate::StoreError;

/// Application directory name under the platform data directory.
const APP_DIR: &str = "movor";

/// Validates that an upload id can be used as a file name inside the store.
///
/// Rejects:
/// - Empty ids
/// - Ids with path separators or a drive/UNC prefix
/// - `.` and `..`
pub fn validate_upload_id(upload_id: &str) -> Result<(), StoreError> {
    if upload_id.is_empty() {
        return Err(StoreError::InvalidId("empty id".into()));
    }

    if upload_id.contains(['/', '\\']) {
        return Err(StoreError::InvalidId(format!(
            "path separator not allowed: {upload_id}"
        )));
    }

    let mut components = Path::new(upload_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(StoreError::InvalidId(format!(
            "not a plain file name: {upload_id}"
        ))),
    }
}

/// Returns the default storage root for persisted uploads.
///
/// `None` when no platform data directory can be resolved, in which case a
/// session cannot be started without an explicit root.
pub fn default_storage_root() -> Option<PathBuf> {
    data_dir().map(|d| d.join(APP_DIR))
}

/// Returns the platform-specific application data directory.
fn data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_DATA_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".local").join("share"))
    }
}
