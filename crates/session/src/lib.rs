//! Resumable upload sessions.
//!
//! A [`Session`] owns the uploads sharing one endpoint. Each upload is a
//! state machine (`Pending → Creating → Uploading → Completed`, with
//! `Paused`, `Failed` and `Cancelled` on the side) that drives a
//! [`TransferEngine`](movor_transfer::TransferEngine) chunk by chunk and
//! persists its record to the [`ChunkStore`](movor_store::ChunkStore) after
//! every transition and every confirmed chunk. Progress, results and
//! failures reach the caller through an [`UploadObserver`].

mod config;
mod error;
mod observer;
mod session;
mod task;

pub use config::SessionConfig;
pub use error::SessionError;
pub use observer::{ChannelObserver, UploadEvent, UploadObserver};
pub use session::{Session, UploadOptions};
pub use task::TaskHandle;

pub use movor_protocol::{SessionState, UploadRecord, UploadState};
