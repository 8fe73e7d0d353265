//! Shared data model for the movor resumable upload core.
//!
//! Holds the persisted [`UploadRecord`], the [`UploadState`] lifecycle and
//! the tus wire constants used by the transfer engine. This crate performs
//! no I/O.

pub mod constants;
pub mod metadata;
pub mod types;

pub use types::{RecordError, SessionState, UploadRecord, UploadState};
