use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use movor_protocol::UploadRecord;
use movor_protocol::constants::STORE_IDENTIFIER;
use tracing::{debug, trace, warn};

use crate::{StoreError, validate_upload_id};

const RECORD_EXTENSION: &str = "json";
const WRITE_CHECK_FILE: &str = ".write-check";

/// File-backed store of [`UploadRecord`]s, one JSON document per upload.
///
/// Writes to the same upload id are serialized; writes to distinct ids may
/// proceed concurrently. Each write lands atomically (temp file + rename),
/// so a crash leaves either the previous or the new record on disk.
pub struct ChunkStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChunkStore {
    /// Opens (creating if needed) the store beneath `root`.
    ///
    /// Fails with [`StoreError::Unavailable`] when the directory cannot be
    /// created or is not writable.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let dir = root.join(STORE_IDENTIFIER);
        let unavailable = |source| StoreError::Unavailable {
            path: dir.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(unavailable)?;

        let check = dir.join(WRITE_CHECK_FILE);
        fs::write(&check, b"").map_err(unavailable)?;
        fs::remove_file(&check).map_err(unavailable)?;

        debug!(dir = %dir.display(), "upload store opened");
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Inserts or replaces the record for `record.upload_id`.
    pub fn put(&self, record: &UploadRecord) -> Result<(), StoreError> {
        let id = record.upload_id.as_str();
        validate_upload_id(id)?;
        let json = serde_json::to_vec_pretty(record)?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let path = self.record_path(id);
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        let io = |source| StoreError::Io {
            upload_id: id.to_string(),
            source,
        };

        let mut file = File::create(&tmp).map_err(io)?;
        file.write_all(&json).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        fs::rename(&tmp, &path).map_err(io)?;

        trace!(
            upload_id = %id,
            state = %record.state(),
            offset = record.bytes_confirmed(),
            "record persisted"
        );
        Ok(())
    }

    /// Loads the record for `upload_id`.
    ///
    /// Returns `Ok(None)` when absent and [`StoreError::Corrupt`] when the
    /// file exists but cannot be decoded; callers treat the latter as absent.
    pub fn get(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        validate_upload_id(upload_id)?;

        let lock = self.lock_for(upload_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.read_record(upload_id)
    }

    /// Removes the record for `upload_id`. Removing an absent record is not
    /// an error.
    pub fn delete(&self, upload_id: &str) -> Result<(), StoreError> {
        validate_upload_id(upload_id)?;

        let lock = self.lock_for(upload_id);
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let result = match fs::remove_file(self.record_path(upload_id)) {
            Ok(()) => {
                debug!(upload_id = %upload_id, "record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                upload_id: upload_id.to_string(),
                source,
            }),
        };
        drop(guard);
        self.release_lock(upload_id, lock);
        result
    }

    /// Loads every persisted record, ordered by upload id.
    ///
    /// Each entry is decoded independently: a corrupt file yields an `Err`
    /// entry without hiding the others.
    pub fn list_all(&self) -> Result<Vec<Result<UploadRecord, StoreError>>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Unavailable {
            path: self.dir.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str())
                && validate_upload_id(id).is_ok()
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id) {
                Ok(Some(record)) => out.push(Ok(record)),
                // Deleted between listing and reading.
                Ok(None) => {}
                Err(e) => {
                    warn!(upload_id = %id, error = %e, "skipping unreadable record");
                    out.push(Err(e));
                }
            }
        }
        Ok(out)
    }

    fn read_record(&self, upload_id: &str) -> Result<Option<UploadRecord>, StoreError> {
        let data = match fs::read(self.record_path(upload_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    upload_id: upload_id.to_string(),
                    source,
                });
            }
        };

        let record: UploadRecord =
            serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
                upload_id: upload_id.to_string(),
                reason: e.to_string(),
            })?;

        if record.upload_id != upload_id {
            return Err(StoreError::Corrupt {
                upload_id: upload_id.to_string(),
                reason: format!("file holds record for {}", record.upload_id),
            });
        }
        if record.bytes_confirmed() > record.total_bytes {
            return Err(StoreError::Corrupt {
                upload_id: upload_id.to_string(),
                reason: "confirmed offset exceeds total size".into(),
            });
        }
        Ok(Some(record))
    }

    fn record_path(&self, upload_id: &str) -> PathBuf {
        self.dir.join(format!("{upload_id}.{RECORD_EXTENSION}"))
    }

    fn lock_for(&self, upload_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry for `upload_id` unless another caller still holds it.
    fn release_lock(&self, upload_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference is the map's, one is ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(upload_id);
        }
    }
}
