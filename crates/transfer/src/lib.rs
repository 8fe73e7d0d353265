//! Wire protocol for resumable chunked uploads.
//!
//! The [`TransferEngine`] trait is the seam between the upload state
//! machine and the network: create a remote upload resource, query the
//! offset the server has confirmed, and send byte ranges. The
//! [`HttpTransferEngine`] speaks tus 1.0.0 over `reqwest`; tests substitute
//! in-memory engines.

mod chunked;
mod engine;
mod error;
mod http;
mod retry;

pub use chunked::{Chunk, ChunkReader, checksum_header};
pub use engine::{ChunkRequest, CreateRequest, TransferEngine, TransferFuture};
pub use error::TransferError;
pub use http::HttpTransferEngine;
pub use retry::Backoff;

/// Default chunk size: 4 MiB.
///
/// Smaller chunks bound per-request memory and give finer progress at the
/// cost of more round trips.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
