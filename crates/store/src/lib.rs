//! Durable storage for upload records.
//!
//! Every upload is persisted as one JSON document named after its upload
//! identifier, inside a directory named by
//! [`STORE_IDENTIFIER`](movor_protocol::constants::STORE_IDENTIFIER) beneath
//! a caller-chosen storage root. Records survive process restarts and are
//! the source of truth for uploads that are not loaded in a session.

mod error;
mod paths;
mod store;

pub use error::StoreError;
pub use paths::{default_storage_root, validate_upload_id};
pub use store::ChunkStore;
