//! The upload session.
//!
//! A [`Session`] binds one endpoint and [`SessionConfig`] to a set of
//! uploads. Each upload runs as its own tokio task; the session only keeps
//! the control tokens and the published record of each one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use movor_protocol::constants::METADATA_FILENAME;
use movor_protocol::{SessionState, UploadRecord, UploadState};
use movor_store::ChunkStore;
use movor_transfer::{HttpTransferEngine, TransferEngine};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::{TaskContext, TaskExit, UploadTask, remove_record, terminate_remote};
use crate::{SessionConfig, SessionError, TaskHandle, UploadObserver};

/// Per-upload additions to the session's headers and metadata.
///
/// Entries here override session entries with the same key.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub headers: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

/// Manages the uploads sharing one endpoint and configuration.
///
/// A session starts [`Stopped`](SessionState::Stopped). [`start`](Self::start)
/// opens the upload store; until it succeeds, no upload can be created.
/// Stopping the session drops in-memory state only. Persisted records stay
/// in the store and are picked up again by [`resume_all`](Self::resume_all).
pub struct Session {
    observer: Arc<dyn UploadObserver>,
    engine: Option<Arc<dyn TransferEngine>>,
    inner: Mutex<Inner>,
}

enum Inner {
    Stopped,
    Active(ActiveSession),
}

struct ActiveSession {
    endpoint: String,
    ctx: TaskContext,
    tasks: HashMap<String, TaskSlot>,
}

/// A loaded upload: its published record and, while a run exists, the
/// controls of that run.
struct TaskSlot {
    snapshot: Arc<watch::Sender<UploadRecord>>,
    run: Option<RunningTask>,
}

struct RunningTask {
    pause: CancellationToken,
    cancel: CancellationToken,
    join: JoinHandle<TaskExit>,
}

impl TaskSlot {
    fn record(&self) -> UploadRecord {
        self.snapshot.borrow().clone()
    }

    fn is_running(&self) -> bool {
        self.snapshot.borrow().state().is_running()
    }

    fn handle(&self, upload_id: &str) -> TaskHandle {
        TaskHandle::new(upload_id.to_string(), self.snapshot.subscribe())
    }

    fn signal_pause(&self) {
        if let Some(run) = &self.run {
            run.pause.cancel();
        }
    }

    fn signal_cancel(&self) {
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }

    /// Waits for the current run, if any, to finish.
    async fn reap(&mut self) -> Option<TaskExit> {
        let run = self.run.take()?;
        match run.join.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!(error = %e, "upload task ended abnormally");
                None
            }
        }
    }
}

impl ActiveSession {
    /// Starts a run for `record`, reusing the slot's published record so
    /// existing handles follow the new run.
    ///
    /// Any previous run of the slot must have been reaped.
    async fn spawn(&mut self, record: UploadRecord) -> Result<TaskHandle, SessionError> {
        let id = record.upload_id.clone();
        let snapshot = match self.tasks.get(&id) {
            Some(slot) => slot.snapshot.clone(),
            None => Arc::new(watch::channel(record.clone()).0),
        };
        let state = record.state();

        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();
        let task = UploadTask::start(
            record,
            self.ctx.clone(),
            snapshot.clone(),
            pause.clone(),
            cancel.clone(),
        )
        .await
        .map_err(|e| {
            debug!(upload_id = %id, error = %e, "cannot start upload");
            SessionError::InvalidState {
                upload_id: id.clone(),
                state,
            }
        })?;
        let join = tokio::spawn(task.run());

        let handle = TaskHandle::new(id.clone(), snapshot.subscribe());
        self.tasks.insert(
            id,
            TaskSlot {
                snapshot,
                run: Some(RunningTask {
                    pause,
                    cancel,
                    join,
                }),
            },
        );
        Ok(handle)
    }

    /// Loads a record that has no slot in this session.
    fn load(&self, upload_id: &str) -> Result<Option<UploadRecord>, SessionError> {
        match self.ctx.store.get(upload_id) {
            Ok(record) => Ok(record.map(UploadRecord::restore)),
            Err(e) if e.is_corrupt() => {
                warn!(upload_id = %upload_id, error = %e, "ignoring corrupt record");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Session {
    /// Creates a stopped session that talks tus over HTTP once started.
    pub fn new(observer: Arc<dyn UploadObserver>) -> Self {
        Self {
            observer,
            engine: None,
            inner: Mutex::new(Inner::Stopped),
        }
    }

    /// Creates a stopped session using `engine` for every transfer.
    pub fn with_engine(observer: Arc<dyn UploadObserver>, engine: Arc<dyn TransferEngine>) -> Self {
        Self {
            observer,
            engine: Some(engine),
            inner: Mutex::new(Inner::Stopped),
        }
    }

    pub async fn state(&self) -> SessionState {
        match &*self.inner.lock().await {
            Inner::Stopped => SessionState::Stopped,
            Inner::Active(_) => SessionState::Active,
        }
    }

    /// Opens the upload store and activates the session.
    ///
    /// Fails with [`SessionError::StoreUnavailable`] when no writable
    /// storage location exists; the session then stays stopped.
    pub async fn start(&self, endpoint: &str, config: SessionConfig) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        if matches!(*inner, Inner::Active(_)) {
            return Err(SessionError::AlreadyActive);
        }

        validate_endpoint(endpoint)?;

        let root = config.resolved_storage_root().ok_or_else(|| {
            SessionError::StoreUnavailable("no storage location could be resolved".into())
        })?;
        let store = ChunkStore::open(&root).map_err(|e| {
            warn!(root = %root.display(), error = %e, "cannot open upload store");
            SessionError::StoreUnavailable(e.to_string())
        })?;

        let engine: Arc<dyn TransferEngine> = match &self.engine {
            Some(engine) => engine.clone(),
            None => Arc::new(
                HttpTransferEngine::with_timeouts(config.request_timeout(), config.connect_timeout())?
                    .with_checksum(config.checksum),
            ),
        };

        info!(
            endpoint = %endpoint,
            store = %store.dir().display(),
            chunk_size = config.effective_chunk_size(),
            max_retries = config.effective_max_retries(),
            "session started"
        );
        *inner = Inner::Active(ActiveSession {
            endpoint: endpoint.to_string(),
            ctx: TaskContext {
                engine,
                store: Arc::new(store),
                observer: self.observer.clone(),
                config: Arc::new(config),
            },
            tasks: HashMap::new(),
        });
        Ok(())
    }

    /// Starts uploading the file at `path`.
    pub async fn upload(&self, path: impl AsRef<Path>) -> Result<TaskHandle, SessionError> {
        self.upload_with(path, UploadOptions::default()).await
    }

    /// Starts uploading the file at `path` with extra headers and metadata.
    ///
    /// Fails with [`SessionError::TaskCreation`] when the session is not
    /// active or the file cannot be read. Nothing is persisted then.
    pub async fn upload_with(
        &self,
        path: impl AsRef<Path>,
        options: UploadOptions,
    ) -> Result<TaskHandle, SessionError> {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return Err(SessionError::TaskCreation("session is not active".into()));
        };

        let (path, total) = inspect_file(path.as_ref())?;
        let id = Uuid::new_v4().to_string();

        let mut record = UploadRecord::new(id.clone(), path.clone(), active.endpoint.clone(), total);
        record.headers = merged(&active.ctx.config.headers, options.headers);
        record.metadata = merged(&active.ctx.config.metadata, options.metadata);
        if let Some(name) = path.file_name() {
            record.metadata.insert(
                METADATA_FILENAME.to_string(),
                name.to_string_lossy().into_owned(),
            );
        }

        info!(upload_id = %id, path = %path.display(), total, "upload created");
        active
            .spawn(record)
            .await
            .map_err(|e| SessionError::TaskCreation(e.to_string()))
    }

    /// Resumes every non-terminal upload known to the store or this session.
    ///
    /// Unreadable records are skipped. Uploads already running are left
    /// alone. Returns the number of uploads started.
    pub async fn resume_all(&self) -> Result<usize, SessionError> {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return Err(SessionError::NotActive);
        };

        let mut candidates = BTreeMap::new();
        for entry in active.ctx.store.list_all()? {
            // Unreadable entries were already logged by the store.
            if let Ok(record) = entry {
                candidates.insert(record.upload_id.clone(), record.restore());
            }
        }
        for (id, slot) in &active.tasks {
            if slot.is_running() {
                candidates.remove(id);
            } else {
                candidates.insert(id.clone(), slot.record());
            }
        }

        let mut resumed = 0;
        for (id, mut record) in candidates {
            if record.state().is_terminal() {
                continue;
            }
            record.retry_count = 0;
            if let Some(slot) = active.tasks.get_mut(&id) {
                slot.reap().await;
            }
            match active.spawn(record).await {
                Ok(_) => resumed += 1,
                Err(e) => warn!(upload_id = %id, error = %e, "cannot resume upload"),
            }
        }

        info!(resumed, "uploads resumed");
        Ok(resumed)
    }

    /// Resumes one upload, or retries it after a failure.
    ///
    /// Returns the existing handle when the upload is already running.
    pub async fn resume(&self, upload_id: &str) -> Result<TaskHandle, SessionError> {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return Err(SessionError::NotActive);
        };

        let mut record = match active.tasks.get_mut(upload_id) {
            Some(slot) if slot.is_running() => return Ok(slot.handle(upload_id)),
            Some(slot) => {
                slot.reap().await;
                slot.record()
            }
            None => active
                .load(upload_id)?
                .ok_or_else(|| SessionError::UnknownUpload(upload_id.to_string()))?,
        };

        if record.state().is_terminal() {
            return Err(SessionError::InvalidState {
                upload_id: upload_id.to_string(),
                state: record.state(),
            });
        }
        record.retry_count = 0;
        active.spawn(record).await
    }

    /// Pauses one upload and waits until its offset is persisted.
    ///
    /// Returns the state the upload settled in, which is not `Paused` when
    /// it finished before the request was observed.
    pub async fn pause(&self, upload_id: &str) -> Result<UploadState, SessionError> {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return Err(SessionError::NotActive);
        };

        let slot = active
            .tasks
            .get_mut(upload_id)
            .ok_or_else(|| SessionError::UnknownUpload(upload_id.to_string()))?;
        slot.signal_pause();
        slot.reap().await;
        Ok(slot.record().state())
    }

    /// Cancels one upload and purges its record. Cancelling an upload that
    /// is already gone succeeds.
    pub async fn cancel(&self, upload_id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return Err(SessionError::NotActive);
        };

        if let Some(mut slot) = active.tasks.remove(upload_id) {
            slot.signal_cancel();
            slot.reap().await;
            let record = slot.record();
            match record.state() {
                UploadState::Cancelled => {}
                UploadState::Completed => {
                    active.tasks.insert(upload_id.to_string(), slot);
                    return Err(SessionError::InvalidState {
                        upload_id: upload_id.to_string(),
                        state: UploadState::Completed,
                    });
                }
                _ => discard(&active.ctx, record, Some(slot.snapshot.as_ref())).await,
            }
            return Ok(());
        }

        match active.load(upload_id)? {
            Some(record) if record.state() == UploadState::Completed => {
                Err(SessionError::InvalidState {
                    upload_id: upload_id.to_string(),
                    state: UploadState::Completed,
                })
            }
            Some(record) => {
                discard(&active.ctx, record, None).await;
                Ok(())
            }
            None => {
                remove_record(&active.ctx.store, upload_id).await;
                Ok(())
            }
        }
    }

    /// Pauses every running upload and waits for each to persist its state.
    ///
    /// Returns `true` when every upload stopped with its record written.
    pub async fn stop_all(&self) -> bool {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return true;
        };

        for slot in active.tasks.values() {
            slot.signal_pause();
        }

        let mut complete = true;
        for (id, slot) in active.tasks.iter_mut() {
            let had_run = slot.run.is_some();
            match slot.reap().await {
                Some(exit) if exit.persisted && !exit.state.is_running() => {}
                Some(exit) => {
                    warn!(upload_id = %id, state = %exit.state, "upload did not stop cleanly");
                    complete = false;
                }
                None if had_run => complete = false,
                None => {}
            }
        }

        info!(tasks = active.tasks.len(), complete, "all uploads stopped");
        complete
    }

    /// Cancels every upload of the session and purges its records, including
    /// persisted uploads not loaded yet. Returns the number cancelled.
    pub async fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = &mut *inner else {
            return 0;
        };

        for slot in active.tasks.values() {
            slot.signal_cancel();
        }

        let mut cancelled = 0;
        let ids: Vec<String> = active.tasks.keys().cloned().collect();
        for id in ids {
            let Some(mut slot) = active.tasks.remove(&id) else {
                continue;
            };
            slot.reap().await;
            let record = slot.record();
            match record.state() {
                UploadState::Completed => {
                    active.tasks.insert(id, slot);
                    continue;
                }
                UploadState::Cancelled => {}
                _ => discard(&active.ctx, record, Some(slot.snapshot.as_ref())).await,
            }
            cancelled += 1;
        }

        match active.ctx.store.list_all() {
            Ok(entries) => {
                for record in entries.into_iter().flatten() {
                    if !record.state().is_terminal() {
                        discard(&active.ctx, record, None).await;
                        cancelled += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot list stored uploads"),
        }

        info!(cancelled, "all uploads cancelled");
        cancelled
    }

    /// Drops all in-memory state without touching the store.
    ///
    /// Running uploads are aborted where they stand; their last persisted
    /// records remain resumable after the next [`start`](Self::start).
    pub async fn stop_session(&self) {
        let mut inner = self.inner.lock().await;
        let Inner::Active(active) = std::mem::replace(&mut *inner, Inner::Stopped) else {
            return;
        };

        for slot in active.tasks.into_values() {
            if let Some(run) = slot.run {
                run.join.abort();
                let _ = run.join.await;
            }
        }
        info!(endpoint = %active.endpoint, "session stopped");
    }

    /// Handles of every upload loaded in this session, ordered by id.
    pub async fn tasks(&self) -> Vec<TaskHandle> {
        let inner = self.inner.lock().await;
        let Inner::Active(active) = &*inner else {
            return Vec::new();
        };
        let mut handles: Vec<TaskHandle> = active
            .tasks
            .iter()
            .map(|(id, slot)| slot.handle(id))
            .collect();
        handles.sort_by(|a, b| a.upload_id().cmp(b.upload_id()));
        handles
    }

    pub async fn task(&self, upload_id: &str) -> Option<TaskHandle> {
        let inner = self.inner.lock().await;
        let Inner::Active(active) = &*inner else {
            return None;
        };
        active.tasks.get(upload_id).map(|slot| slot.handle(upload_id))
    }
}

/// Moves an upload that is not running to `Cancelled`, purges its record
/// and releases its remote resource.
async fn discard(
    ctx: &TaskContext,
    mut record: UploadRecord,
    snapshot: Option<&watch::Sender<UploadRecord>>,
) {
    if let Err(e) = record.transition(UploadState::Cancelled) {
        warn!(upload_id = %record.upload_id, error = %e, "cannot cancel upload");
    }
    remove_record(&ctx.store, &record.upload_id).await;
    terminate_remote(ctx, &record).await;

    info!(upload_id = %record.upload_id, "upload cancelled");
    ctx.observer
        .on_state_change(&record.upload_id, record.state());
    if let Some(tx) = snapshot {
        tx.send_replace(record);
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), SessionError> {
    let invalid = |reason: String| SessionError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = reqwest::Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other}"))),
    }
}

/// Resolves `path` and returns it with its size, failing when it is not a
/// readable regular file.
fn inspect_file(path: &Path) -> Result<(PathBuf, u64), SessionError> {
    let unreadable = |e: std::io::Error| {
        SessionError::TaskCreation(format!("cannot read {}: {e}", path.display()))
    };
    let resolved = std::fs::canonicalize(path).map_err(unreadable)?;
    let file = std::fs::File::open(&resolved).map_err(unreadable)?;
    let meta = file.metadata().map_err(unreadable)?;
    if !meta.is_file() {
        return Err(SessionError::TaskCreation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok((resolved, meta.len()))
}

fn merged(
    base: &BTreeMap<String, String>,
    overrides: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = base.clone();
    out.extend(overrides);
    out
}
