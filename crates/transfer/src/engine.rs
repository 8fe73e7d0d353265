//! The transfer engine seam.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::TransferError;

/// Boxed future returned by [`TransferEngine`] methods.
pub type TransferFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Parameters of the creation handshake.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub endpoint: &'a str,
    pub total_bytes: u64,
    pub headers: &'a BTreeMap<String, String>,
    pub metadata: &'a BTreeMap<String, String>,
}

/// One byte range `[offset, min(offset + chunk_size, total_bytes))` of a
/// local file.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    pub resource_url: &'a str,
    pub file_path: &'a Path,
    pub offset: u64,
    pub chunk_size: u64,
    /// Declared `Upload-Length` of the resource.
    pub total_bytes: u64,
    pub headers: &'a BTreeMap<String, String>,
}

/// Abstract wire protocol for resumable uploads.
///
/// Implementations must be safe to call concurrently for different
/// uploads. Calls for one upload are issued strictly in sequence by its
/// task, and a call's future may be dropped at any await point when the
/// task is paused or cancelled.
pub trait TransferEngine: Send + Sync {
    /// Creates the remote upload resource and returns its URL.
    fn create_remote_resource<'a>(&'a self, req: CreateRequest<'a>) -> TransferFuture<'a, String>;

    /// Returns the number of bytes the server has confirmed.
    fn query_offset<'a>(
        &'a self,
        resource_url: &'a str,
        headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, u64>;

    /// Sends one chunk and returns the new confirmed offset.
    fn send_chunk<'a>(&'a self, req: ChunkRequest<'a>) -> TransferFuture<'a, u64>;

    /// Releases the remote resource of a cancelled upload.
    ///
    /// Best-effort; the default does nothing.
    fn terminate<'a>(
        &'a self,
        _resource_url: &'a str,
        _headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}
