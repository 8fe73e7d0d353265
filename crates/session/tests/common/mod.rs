#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use movor_session::{SessionConfig, UploadEvent};
use movor_transfer::{
    Backoff, ChunkRequest, CreateRequest, TransferEngine, TransferError, TransferFuture,
};
use tokio::sync::{Semaphore, mpsc};

pub const ENDPOINT: &str = "https://tus.example/files/";

struct Resource {
    offset: u64,
    total: u64,
}

/// A creation request as the server saw it.
#[derive(Debug, Clone)]
pub struct Created {
    pub url: String,
    pub total: u64,
    pub headers: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

/// In-memory tus server.
///
/// Tracks each resource's confirmed offset, rejects chunks sent at the
/// wrong offset, and can be told to fail or to hold chunk requests.
#[derive(Default)]
pub struct MockEngine {
    resources: Mutex<HashMap<String, Resource>>,
    next_id: AtomicUsize,
    created: Mutex<Vec<Created>>,
    sends: Mutex<Vec<(String, u64)>>,
    terminated: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<TransferError>>,
    fail_always: Mutex<Option<fn() -> TransferError>>,
    reject_length: Mutex<Option<u64>>,
    gate: Option<Semaphore>,
    pub send_attempts: AtomicUsize,
    pub queries: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets only `permits` chunk requests through until [`open_gate`] adds
    /// more. Held requests wait for a permit.
    pub fn gated(permits: usize) -> Self {
        Self {
            gate: Some(Semaphore::new(permits)),
            ..Self::default()
        }
    }

    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    /// Fails the next chunk requests with `errors`, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TransferError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn fail_always(&self, make: fn() -> TransferError) {
        *self.fail_always.lock().unwrap() = Some(make);
    }

    pub fn heal(&self) {
        *self.fail_always.lock().unwrap() = None;
        self.failures.lock().unwrap().clear();
    }

    /// Refuses to create uploads of exactly `total` bytes.
    pub fn reject_length(&self, total: u64) {
        *self.reject_length.lock().unwrap() = Some(total);
    }

    /// Registers a resource as if it had been created earlier.
    pub fn register(&self, url: &str, total: u64, offset: u64) {
        self.resources
            .lock()
            .unwrap()
            .insert(url.to_string(), Resource { offset, total });
    }

    pub fn created(&self) -> Vec<Created> {
        self.created.lock().unwrap().clone()
    }

    /// Offsets of the accepted chunks of `url`, in order.
    pub fn sends_for(&self, url: &str) -> Vec<u64> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, from)| *from)
            .collect()
    }

    pub fn server_offset(&self, url: &str) -> Option<u64> {
        self.resources.lock().unwrap().get(url).map(|r| r.offset)
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

impl TransferEngine for MockEngine {
    fn create_remote_resource<'a>(&'a self, req: CreateRequest<'a>) -> TransferFuture<'a, String> {
        Box::pin(async move {
            if *self.reject_length.lock().unwrap() == Some(req.total_bytes) {
                return Err(TransferError::Creation {
                    status: 413,
                    message: "too large".into(),
                });
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let url = format!("{}r{n}", req.endpoint);
            self.register(&url, req.total_bytes, 0);
            self.created.lock().unwrap().push(Created {
                url: url.clone(),
                total: req.total_bytes,
                headers: req.headers.clone(),
                metadata: req.metadata.clone(),
            });
            Ok(url)
        })
    }

    fn query_offset<'a>(
        &'a self,
        resource_url: &'a str,
        _headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, u64> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.server_offset(resource_url)
                .ok_or_else(|| TransferError::NotFound(resource_url.to_string()))
        })
    }

    fn send_chunk<'a>(&'a self, req: ChunkRequest<'a>) -> TransferFuture<'a, u64> {
        Box::pin(async move {
            self.send_attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TransferError::Network("gate closed".into()))?;
                permit.forget();
            }

            let always = *self.fail_always.lock().unwrap();
            if let Some(make) = always {
                return Err(make());
            }
            let next_failure = self.failures.lock().unwrap().pop_front();
            if let Some(e) = next_failure {
                return Err(e);
            }

            let mut resources = self.resources.lock().unwrap();
            let resource = resources
                .get_mut(req.resource_url)
                .ok_or_else(|| TransferError::NotFound(req.resource_url.to_string()))?;
            if req.offset != resource.offset {
                return Err(TransferError::OffsetMismatch { offset: req.offset });
            }
            let end = (req.offset + req.chunk_size).min(resource.total);
            resource.offset = end;
            self.sends
                .lock()
                .unwrap()
                .push((req.resource_url.to_string(), req.offset));
            Ok(end)
        })
    }

    fn terminate<'a>(
        &'a self,
        resource_url: &'a str,
        _headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, ()> {
        Box::pin(async move {
            self.resources.lock().unwrap().remove(resource_url);
            self.terminated
                .lock()
                .unwrap()
                .push(resource_url.to_string());
            Ok(())
        })
    }
}

pub fn config(root: &Path, chunk_size: u64) -> SessionConfig {
    SessionConfig {
        chunk_size,
        backoff: Backoff::immediate(),
        storage_root: Some(root.to_path_buf()),
        ..Default::default()
    }
}

pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

pub fn progress_of(events: &[UploadEvent], id: &str) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Progress {
                upload_id,
                bytes_written,
                ..
            } if upload_id == id => Some(*bytes_written),
            _ => None,
        })
        .collect()
}

pub fn results_of(events: &[UploadEvent], id: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            UploadEvent::Completed {
                upload_id,
                remote_url,
            } if upload_id == id => Some(remote_url.clone()),
            _ => None,
        })
        .collect()
}

pub fn failures_of(events: &[UploadEvent], id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, UploadEvent::Failed { upload_id, .. } if upload_id == id))
        .count()
}

/// Polls `cond` until it holds, panicking after a generous timeout.
pub async fn until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
