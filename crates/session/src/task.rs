//! The per-upload state machine.
//!
//! A running task exclusively owns its [`UploadRecord`]. Every mutation is
//! persisted to the store and then published to [`TaskHandle`]s through a
//! watch channel, so readers always see a whole record.

use std::future::Future;
use std::sync::Arc;

use movor_protocol::{RecordError, UploadRecord, UploadState};
use movor_store::ChunkStore;
use movor_transfer::{ChunkRequest, CreateRequest, TransferEngine, TransferError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{SessionConfig, UploadObserver};

/// Collaborators shared by every task of a session.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub engine: Arc<dyn TransferEngine>,
    pub store: Arc<ChunkStore>,
    pub observer: Arc<dyn UploadObserver>,
    pub config: Arc<SessionConfig>,
}

/// Result of a finished run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TaskExit {
    pub state: UploadState,
    /// Whether the final record write succeeded.
    pub persisted: bool,
}

/// Why the transfer loop stopped short of completion.
enum Halt {
    Paused,
    Cancelled,
    Failed(TransferError),
}

impl From<RecordError> for Halt {
    fn from(e: RecordError) -> Self {
        Self::Failed(TransferError::Protocol(e.to_string()))
    }
}

pub(crate) struct UploadTask {
    record: UploadRecord,
    ctx: TaskContext,
    snapshot: Arc<watch::Sender<UploadRecord>>,
    pause: CancellationToken,
    cancel: CancellationToken,
}

impl UploadTask {
    /// Prepares a run and enters its first running state: `Creating` when
    /// no remote resource exists yet, `Uploading` otherwise.
    pub async fn start(
        mut record: UploadRecord,
        ctx: TaskContext,
        snapshot: Arc<watch::Sender<UploadRecord>>,
        pause: CancellationToken,
        cancel: CancellationToken,
    ) -> Result<Self, RecordError> {
        let first = if record.remote_resource_url().is_some() {
            UploadState::Uploading
        } else {
            UploadState::Creating
        };
        record.transition(first)?;

        let task = Self {
            record,
            ctx,
            snapshot,
            pause,
            cancel,
        };
        task.persist().await;
        task.ctx
            .observer
            .on_state_change(&task.record.upload_id, first);
        task.publish();
        info!(
            upload_id = %task.record.upload_id,
            state = %first,
            offset = task.record.bytes_confirmed(),
            total = task.record.total_bytes,
            "upload started"
        );
        Ok(task)
    }

    /// Drives the upload until it completes, fails, pauses or is cancelled.
    pub async fn run(mut self) -> TaskExit {
        let outcome = self.drive().await;
        match outcome {
            Ok(url) => self.complete(url).await,
            Err(Halt::Paused) => self.paused().await,
            Err(Halt::Cancelled) => self.cancelled().await,
            Err(Halt::Failed(e)) => self.failed(e).await,
        }
    }

    async fn drive(&mut self) -> Result<String, Halt> {
        if self.record.state() == UploadState::Creating {
            self.create().await?;
        } else {
            self.reconcile().await?;
        }
        self.transfer().await?;
        self.resource_url()
    }

    async fn create(&mut self) -> Result<(), Halt> {
        loop {
            let req = CreateRequest {
                endpoint: &self.record.remote_endpoint,
                total_bytes: self.record.total_bytes,
                headers: &self.record.headers,
                metadata: &self.record.metadata,
            };
            let result = self
                .call(self.ctx.engine.create_remote_resource(req))
                .await?;
            match result {
                Ok(url) => {
                    self.record.assign_resource_url(url)?;
                    break;
                }
                Err(e) if self.ctx.config.retry_creation && e.is_retryable() => {
                    self.retry_after(e).await?;
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }

        self.record.retry_count = 0;
        self.enter(UploadState::Uploading).await?;
        Ok(())
    }

    /// Adopts the server's confirmed offset. The server is authoritative.
    async fn reconcile(&mut self) -> Result<(), Halt> {
        let url = self.resource_url()?;
        let server = loop {
            let result = self
                .call(self.ctx.engine.query_offset(&url, &self.record.headers))
                .await?;
            match result {
                Ok(offset) => break offset,
                Err(e) if e.is_retryable() => self.retry_after(e).await?,
                Err(e) => return Err(Halt::Failed(e)),
            }
        };

        let local = self.record.bytes_confirmed();
        let total = self.record.total_bytes;
        if server > total {
            return Err(Halt::Failed(TransferError::Protocol(format!(
                "server offset {server} exceeds upload length {total}"
            ))));
        }
        if server < local {
            warn!(
                upload_id = %self.record.upload_id,
                local,
                server,
                "server offset behind local record"
            );
        }
        if server != local {
            self.record.confirm_offset(server)?;
            self.persist().await;
            self.publish();
        }
        debug!(upload_id = %self.record.upload_id, offset = server, "offset reconciled");
        Ok(())
    }

    async fn transfer(&mut self) -> Result<(), Halt> {
        let url = self.resource_url()?;
        let chunk_size = self.ctx.config.effective_chunk_size();
        let total = self.record.total_bytes;

        while !self.record.is_fully_confirmed() {
            let from = self.record.bytes_confirmed();
            let req = ChunkRequest {
                resource_url: &url,
                file_path: &self.record.local_file_path,
                offset: from,
                chunk_size,
                total_bytes: self.record.total_bytes,
                headers: &self.record.headers,
            };
            let result = self.call(self.ctx.engine.send_chunk(req)).await?;
            match result {
                Ok(offset) if offset > from && offset <= total => {
                    self.record.confirm_offset(offset)?;
                    self.record.retry_count = 0;
                    self.persist().await;
                    self.ctx
                        .observer
                        .on_progress(&self.record.upload_id, offset, total);
                    self.publish();
                    debug!(upload_id = %self.record.upload_id, offset, total, "chunk confirmed");
                }
                Ok(offset) => {
                    return Err(Halt::Failed(TransferError::Protocol(format!(
                        "chunk at {from} acknowledged with offset {offset}"
                    ))));
                }
                Err(e) if e.is_offset_mismatch() => {
                    self.retry_after(e).await?;
                    self.reconcile().await?;
                }
                Err(e) if e.is_retryable() => self.retry_after(e).await?,
                Err(e) => return Err(Halt::Failed(e)),
            }
        }
        Ok(())
    }

    /// Runs one network call under the request timeout, abandoning it as
    /// soon as a pause or cancel is requested.
    async fn call<T>(
        &self,
        op: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<Result<T, TransferError>, Halt> {
        let timeout = self.ctx.config.request_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            _ = self.pause.cancelled() => Err(Halt::Paused),
            result = tokio::time::timeout(timeout, op) => {
                Ok(result.unwrap_or_else(|_| Err(TransferError::Timeout)))
            }
        }
    }

    /// Counts a retryable failure against the budget and waits out the
    /// backoff delay.
    async fn retry_after(&mut self, e: TransferError) -> Result<(), Halt> {
        self.record.retry_count += 1;
        let max = self.ctx.config.effective_max_retries();
        if self.record.retry_count >= max {
            return Err(Halt::Failed(e));
        }

        let attempt = self.record.retry_count;
        let delay = self.ctx.config.backoff.delay_for_attempt(attempt);
        warn!(
            upload_id = %self.record.upload_id,
            attempt,
            max_retries = max,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "transient failure, retrying"
        );
        self.persist().await;
        self.publish();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            _ = self.pause.cancelled() => Err(Halt::Paused),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn complete(mut self, url: String) -> TaskExit {
        if let Err(e) = self.record.transition(UploadState::Completed) {
            return self.failed(TransferError::Protocol(e.to_string())).await;
        }
        let persisted = if self.ctx.config.retain_completed {
            self.persist().await
        } else {
            self.remove().await
        };

        info!(
            upload_id = %self.record.upload_id,
            resource = %url,
            total = self.record.total_bytes,
            "upload completed"
        );
        let id = &self.record.upload_id;
        self.ctx.observer.on_state_change(id, UploadState::Completed);
        self.ctx.observer.on_result(id, &url);
        self.publish();
        TaskExit {
            state: UploadState::Completed,
            persisted,
        }
    }

    async fn paused(mut self) -> TaskExit {
        if let Err(e) = self.record.transition(UploadState::Paused) {
            warn!(upload_id = %self.record.upload_id, error = %e, "cannot pause upload");
        }
        let persisted = self.persist().await;

        info!(
            upload_id = %self.record.upload_id,
            offset = self.record.bytes_confirmed(),
            "upload paused"
        );
        let id = &self.record.upload_id;
        self.ctx.observer.on_state_change(id, self.record.state());
        self.ctx
            .observer
            .on_progress(id, self.record.bytes_confirmed(), self.record.total_bytes);
        self.publish();
        TaskExit {
            state: self.record.state(),
            persisted,
        }
    }

    async fn cancelled(mut self) -> TaskExit {
        if let Err(e) = self.record.transition(UploadState::Cancelled) {
            warn!(upload_id = %self.record.upload_id, error = %e, "cannot cancel upload");
        }
        let persisted = self.remove().await;
        terminate_remote(&self.ctx, &self.record).await;

        info!(upload_id = %self.record.upload_id, "upload cancelled");
        self.ctx
            .observer
            .on_state_change(&self.record.upload_id, self.record.state());
        self.publish();
        TaskExit {
            state: self.record.state(),
            persisted,
        }
    }

    async fn failed(mut self, e: TransferError) -> TaskExit {
        match self.record.transition(UploadState::Failed) {
            Ok(()) => {
                self.ctx
                    .observer
                    .on_state_change(&self.record.upload_id, UploadState::Failed);
            }
            Err(te) => warn!(upload_id = %self.record.upload_id, error = %te, "cannot fail upload"),
        }
        let persisted = self.persist().await;

        error!(
            upload_id = %self.record.upload_id,
            offset = self.record.bytes_confirmed(),
            retryable = e.is_retryable(),
            error = %e,
            "upload failed"
        );
        self.ctx.observer.on_failure(&self.record.upload_id, &e);
        self.publish();
        TaskExit {
            state: self.record.state(),
            persisted,
        }
    }

    async fn enter(&mut self, next: UploadState) -> Result<(), RecordError> {
        self.record.transition(next)?;
        self.persist().await;
        self.ctx
            .observer
            .on_state_change(&self.record.upload_id, next);
        self.publish();
        debug!(upload_id = %self.record.upload_id, state = %next, "state changed");
        Ok(())
    }

    fn resource_url(&self) -> Result<String, Halt> {
        self.record
            .remote_resource_url()
            .map(str::to_owned)
            .ok_or_else(|| Halt::Failed(TransferError::Protocol("no remote resource URL".into())))
    }

    async fn persist(&self) -> bool {
        persist_record(&self.ctx.store, &self.record).await
    }

    async fn remove(&self) -> bool {
        remove_record(&self.ctx.store, &self.record.upload_id).await
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.record.clone());
    }
}

/// Writes `record` on the blocking pool, logging instead of failing.
pub(crate) async fn persist_record(store: &Arc<ChunkStore>, record: &UploadRecord) -> bool {
    let result = tokio::task::spawn_blocking({
        let store = Arc::clone(store);
        let record = record.clone();
        move || store.put(&record)
    })
    .await;
    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(upload_id = %record.upload_id, error = %e, "failed to persist upload record");
            false
        }
        Err(e) => {
            warn!(upload_id = %record.upload_id, error = %e, "store write task failed");
            false
        }
    }
}

pub(crate) async fn remove_record(store: &Arc<ChunkStore>, upload_id: &str) -> bool {
    let result = tokio::task::spawn_blocking({
        let store = Arc::clone(store);
        let upload_id = upload_id.to_string();
        move || store.delete(&upload_id)
    })
    .await;
    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(upload_id = %upload_id, error = %e, "failed to delete upload record");
            false
        }
        Err(e) => {
            warn!(upload_id = %upload_id, error = %e, "store delete task failed");
            false
        }
    }
}

/// Asks the server to release the upload's resource. Best-effort.
pub(crate) async fn terminate_remote(ctx: &TaskContext, record: &UploadRecord) {
    let Some(url) = record.remote_resource_url() else {
        return;
    };
    let timeout = ctx.config.request_timeout();
    match tokio::time::timeout(timeout, ctx.engine.terminate(url, &record.headers)).await {
        Ok(Ok(())) => debug!(upload_id = %record.upload_id, "remote resource released"),
        Ok(Err(e)) => {
            debug!(upload_id = %record.upload_id, error = %e, "failed to release remote resource");
        }
        Err(_) => debug!(upload_id = %record.upload_id, "timed out releasing remote resource"),
    }
}

/// Read-only view of one upload.
///
/// Handles are cheap to clone and stay valid after the task stops; they
/// then keep reporting the last published record.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    upload_id: String,
    rx: watch::Receiver<UploadRecord>,
}

impl TaskHandle {
    pub(crate) fn new(upload_id: String, rx: watch::Receiver<UploadRecord>) -> Self {
        Self { upload_id, rx }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Consistent copy of the current record.
    pub fn snapshot(&self) -> UploadRecord {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> UploadState {
        self.rx.borrow().state()
    }

    pub fn bytes_confirmed(&self) -> u64 {
        self.rx.borrow().bytes_confirmed()
    }

    /// Confirmed fraction of the file, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        self.rx.borrow().progress()
    }

    /// Waits until the upload stops running and returns the state it
    /// stopped in. Every callback of the run has fired by then.
    pub async fn wait(&self) -> UploadState {
        let mut rx = self.rx.clone();
        if let Ok(record) = rx.wait_for(|r| !r.state().is_running()).await {
            return record.state();
        }
        // The session dropped the upload; report what was last published.
        let state = rx.borrow().state();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelObserver, UploadEvent};
    use movor_transfer::{Backoff, TransferFuture};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const URL: &str = "https://tus.example/files/abc";

    /// Engine answering from per-operation scripts.
    #[derive(Default)]
    struct ScriptEngine {
        creates: Mutex<VecDeque<Result<String, TransferError>>>,
        queries: Mutex<VecDeque<Result<u64, TransferError>>>,
        sends: Mutex<VecDeque<Result<u64, TransferError>>>,
        /// Number of upcoming sends that never resolve.
        hung_sends: Mutex<usize>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptEngine {
        fn create(self, r: Result<String, TransferError>) -> Self {
            self.creates.lock().unwrap().push_back(r);
            self
        }

        fn query(self, r: Result<u64, TransferError>) -> Self {
            self.queries.lock().unwrap().push_back(r);
            self
        }

        fn send(self, r: Result<u64, TransferError>) -> Self {
            self.sends.lock().unwrap().push_back(r);
            self
        }

        fn hang_sends(self, n: usize) -> Self {
            *self.hung_sends.lock().unwrap() += n;
            self
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn next<T>(script: &Mutex<VecDeque<Result<T, TransferError>>>) -> Result<T, TransferError> {
        script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransferError::Protocol("unscripted call".into())))
    }

    impl TransferEngine for ScriptEngine {
        fn create_remote_resource<'a>(
            &'a self,
            _req: CreateRequest<'a>,
        ) -> TransferFuture<'a, String> {
            Box::pin(async move {
                self.log.lock().unwrap().push("create".into());
                next(&self.creates)
            })
        }

        fn query_offset<'a>(
            &'a self,
            _resource_url: &'a str,
            _headers: &'a BTreeMap<String, String>,
        ) -> TransferFuture<'a, u64> {
            Box::pin(async move {
                self.log.lock().unwrap().push("query".into());
                next(&self.queries)
            })
        }

        fn send_chunk<'a>(&'a self, req: ChunkRequest<'a>) -> TransferFuture<'a, u64> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("send {}", req.offset));
                let hang = {
                    let mut hung = self.hung_sends.lock().unwrap();
                    let hang = *hung > 0;
                    *hung = hung.saturating_sub(1);
                    hang
                };
                if hang {
                    std::future::pending::<()>().await;
                }
                next(&self.sends)
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: TaskContext,
        engine: Arc<ScriptEngine>,
        events: mpsc::UnboundedReceiver<UploadEvent>,
    }

    fn fixture(engine: ScriptEngine, config: SessionConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let engine = Arc::new(engine);
        let (observer, events) = ChannelObserver::channel();
        let ctx = TaskContext {
            engine: engine.clone(),
            store,
            observer: Arc::new(observer),
            config: Arc::new(config),
        };
        Fixture {
            _dir: dir,
            ctx,
            engine,
            events,
        }
    }

    fn config(chunk_size: u64) -> SessionConfig {
        SessionConfig {
            chunk_size,
            backoff: Backoff::immediate(),
            ..Default::default()
        }
    }

    fn record(total: u64) -> UploadRecord {
        UploadRecord::new("u1", "/tmp/photo.jpg", "https://tus.example/files/", total)
    }

    fn paused_record(total: u64, offset: u64) -> UploadRecord {
        let mut r = record(total);
        r.transition(UploadState::Creating).unwrap();
        r.assign_resource_url(URL).unwrap();
        r.transition(UploadState::Uploading).unwrap();
        r.confirm_offset(offset).unwrap();
        r.transition(UploadState::Paused).unwrap();
        r
    }

    async fn task(
        record: UploadRecord,
        ctx: &TaskContext,
    ) -> (UploadTask, TaskHandle, CancellationToken, CancellationToken) {
        let (tx, rx) = watch::channel(record.clone());
        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();
        let handle = TaskHandle::new(record.upload_id.clone(), rx);
        let task = UploadTask::start(
            record,
            ctx.clone(),
            Arc::new(tx),
            pause.clone(),
            cancel.clone(),
        )
        .await
        .unwrap();
        (task, handle, pause, cancel)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn failures(events: &[UploadEvent]) -> Vec<&UploadEvent> {
        events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Failed { .. }))
            .collect()
    }

    #[tokio::test]
    async fn offset_mismatch_requeries_and_continues() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .send(Ok(4))
            .send(Err(TransferError::OffsetMismatch { offset: 4 }))
            .query(Ok(6))
            .send(Ok(10));
        let mut fx = fixture(engine, config(4));

        let (t, handle, _, _) = task(record(10), &fx.ctx).await;
        let exit = t.run().await;

        assert_eq!(exit.state, UploadState::Completed);
        assert!(exit.persisted);
        assert_eq!(
            fx.engine.log(),
            vec!["create", "send 0", "send 4", "query", "send 6"]
        );
        assert_eq!(handle.snapshot().retry_count, 0);
        assert!((handle.progress() - 1.0).abs() < f64::EPSILON);
        assert!(failures(&drain(&mut fx.events)).is_empty());
        // Completed records are purged by default.
        assert!(fx.ctx.store.get("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_adopts_lower_server_offset() {
        let engine = ScriptEngine::default().query(Ok(2)).send(Ok(6)).send(Ok(10));
        let fx = fixture(engine, config(4));

        let (t, _, _, _) = task(paused_record(10, 8), &fx.ctx).await;
        let exit = t.run().await;

        assert_eq!(exit.state, UploadState::Completed);
        assert_eq!(fx.engine.log(), vec!["query", "send 2", "send 6"]);
    }

    #[tokio::test]
    async fn server_offset_beyond_length_fails() {
        let engine = ScriptEngine::default().query(Ok(11));
        let mut fx = fixture(engine, config(4));

        let (t, _, _, _) = task(paused_record(10, 4), &fx.ctx).await;
        let exit = t.run().await;

        assert_eq!(exit.state, UploadState::Failed);
        let events = drain(&mut fx.events);
        let failed = failures(&events);
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            failed[0],
            UploadEvent::Failed {
                retryable: false,
                ..
            }
        ));
        let stored = fx.ctx.store.get("u1").unwrap().unwrap();
        assert_eq!(stored.state(), UploadState::Failed);
        assert_eq!(stored.bytes_confirmed(), 4);
    }

    #[tokio::test]
    async fn non_advancing_ack_is_protocol_error() {
        let engine = ScriptEngine::default().create(Ok(URL.into())).send(Ok(0));
        let fx = fixture(engine, config(4));

        let (t, _, _, _) = task(record(10), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Failed);
        assert_eq!(fx.engine.log(), vec!["create", "send 0"]);
    }

    #[tokio::test]
    async fn creation_failure_is_not_retried_by_default() {
        let engine = ScriptEngine::default().create(Err(TransferError::Creation {
            status: 503,
            message: "busy".into(),
        }));
        let mut fx = fixture(engine, config(4));

        let (t, handle, _, _) = task(record(10), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Failed);
        assert_eq!(fx.engine.log(), vec!["create"]);
        assert!(handle.snapshot().remote_resource_url().is_none());
        assert_eq!(failures(&drain(&mut fx.events)).len(), 1);
    }

    #[tokio::test]
    async fn creation_retry_uses_budget_when_enabled() {
        let busy = || {
            Err(TransferError::Creation {
                status: 503,
                message: "busy".into(),
            })
        };
        let engine = ScriptEngine::default()
            .create(busy())
            .create(busy())
            .create(Ok(URL.into()))
            .send(Ok(10));
        let fx = fixture(
            engine,
            SessionConfig {
                retry_creation: true,
                ..config(16)
            },
        );

        let (t, handle, _, _) = task(record(10), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Completed);
        assert_eq!(
            fx.engine.log(),
            vec!["create", "create", "create", "send 0"]
        );
        assert_eq!(handle.snapshot().remote_resource_url(), Some(URL));
    }

    #[tokio::test]
    async fn empty_file_completes_without_chunks() {
        let engine = ScriptEngine::default().create(Ok(URL.into()));
        let mut fx = fixture(engine, config(4));

        let (t, handle, _, _) = task(record(0), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Completed);
        assert_eq!(fx.engine.log(), vec!["create"]);
        assert!((handle.progress() - 1.0).abs() < f64::EPSILON);

        let events = drain(&mut fx.events);
        assert!(events.contains(&UploadEvent::Completed {
            upload_id: "u1".into(),
            remote_url: URL.into(),
        }));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, UploadEvent::Progress { .. }))
        );
    }

    #[tokio::test]
    async fn retained_completed_record_stays_in_store() {
        let engine = ScriptEngine::default().create(Ok(URL.into())).send(Ok(3));
        let fx = fixture(
            engine,
            SessionConfig {
                retain_completed: true,
                ..config(4)
            },
        );

        let (t, _, _, _) = task(record(3), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Completed);
        let stored = fx.ctx.store.get("u1").unwrap().unwrap();
        assert_eq!(stored.state(), UploadState::Completed);
        assert_eq!(stored.bytes_confirmed(), 3);
    }

    #[tokio::test]
    async fn cancel_during_backoff() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .send(Err(TransferError::Timeout));
        let slow = Backoff {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            factor: 1.0,
        };
        let mut fx = fixture(
            engine,
            SessionConfig {
                backoff: slow,
                ..config(4)
            },
        );

        let (t, handle, _, cancel) = task(record(10), &fx.ctx).await;
        let join = tokio::spawn(t.run());

        let mut rx = handle.rx.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|r| r.retry_count == 1),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        let exit = join.await.unwrap();
        assert_eq!(exit.state, UploadState::Cancelled);
        assert_eq!(handle.wait().await, UploadState::Cancelled);
        assert!(fx.ctx.store.get("u1").unwrap().is_none());
        assert!(failures(&drain(&mut fx.events)).is_empty());
    }

    #[tokio::test]
    async fn pause_during_backoff_persists_offset() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .send(Ok(4))
            .send(Err(TransferError::Network("reset".into())));
        let slow = Backoff {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            factor: 1.0,
        };
        let mut fx = fixture(
            engine,
            SessionConfig {
                backoff: slow,
                ..config(4)
            },
        );

        let (t, handle, pause, _) = task(record(10), &fx.ctx).await;
        let join = tokio::spawn(t.run());

        let mut rx = handle.rx.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|r| r.retry_count == 1),
        )
        .await
        .unwrap()
        .unwrap();

        pause.cancel();
        let exit = join.await.unwrap();
        assert_eq!(exit.state, UploadState::Paused);
        assert!(exit.persisted);

        let stored = fx.ctx.store.get("u1").unwrap().unwrap();
        assert_eq!(stored.state(), UploadState::Paused);
        assert_eq!(stored.bytes_confirmed(), 4);

        // The final event is the progress snapshot.
        let events = drain(&mut fx.events);
        assert_eq!(
            events.last(),
            Some(&UploadEvent::Progress {
                upload_id: "u1".into(),
                bytes_written: 4,
                bytes_total: 10,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_send_times_out_and_is_retried() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .hang_sends(1)
            .send(Ok(10));
        let mut fx = fixture(
            engine,
            SessionConfig {
                request_timeout_secs: 5,
                ..config(10)
            },
        );

        let started = tokio::time::Instant::now();
        let (t, handle, _, _) = task(record(10), &fx.ctx).await;
        let exit = t.run().await;

        assert_eq!(exit.state, UploadState::Completed);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(fx.engine.log(), vec!["create", "send 0", "send 0"]);
        assert_eq!(handle.snapshot().retry_count, 0);
        assert!(failures(&drain(&mut fx.events)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sends_exhaust_budget_as_timeouts() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .hang_sends(usize::MAX);
        let mut fx = fixture(
            engine,
            SessionConfig {
                request_timeout_secs: 5,
                max_retries: 2,
                ..config(10)
            },
        );

        let (t, _, _, _) = task(record(10), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Failed);
        assert_eq!(fx.engine.log(), vec!["create", "send 0", "send 0"]);

        let events = drain(&mut fx.events);
        let failed = failures(&events);
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0],
            &UploadEvent::Failed {
                upload_id: "u1".into(),
                error: TransferError::Timeout.to_string(),
                retryable: true,
            }
        );
    }

    #[tokio::test]
    async fn persist_and_remove_report_store_outcome() {
        let fx = fixture(ScriptEngine::default(), config(4));

        assert!(persist_record(&fx.ctx.store, &record(10)).await);
        assert!(fx.ctx.store.get("u1").unwrap().is_some());

        let bad = UploadRecord::new(
            "../escape",
            "/tmp/photo.jpg",
            "https://tus.example/files/",
            1,
        );
        assert!(!persist_record(&fx.ctx.store, &bad).await);

        assert!(remove_record(&fx.ctx.store, "u1").await);
        assert!(fx.ctx.store.get("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_local_file_fails_without_retry() {
        let engine = ScriptEngine::default()
            .create(Ok(URL.into()))
            .send(Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "gone",
            ))));
        let mut fx = fixture(engine, config(4));

        let (t, _, _, _) = task(record(10), &fx.ctx).await;
        assert_eq!(t.run().await.state, UploadState::Failed);
        assert_eq!(fx.engine.log(), vec!["create", "send 0"]);
        assert_eq!(failures(&drain(&mut fx.events)).len(), 1);
    }
}
