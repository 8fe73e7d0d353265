//! tus 1.0.0 protocol constants.

/// Protocol version sent in every request.
pub const TUS_VERSION: &str = "1.0.0";

/// Fixed name of the directory holding persisted upload records.
pub const STORE_IDENTIFIER: &str = "upload-store";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_CHECKSUM: &str = "Upload-Checksum";

/// Content type required for PATCH bodies.
pub const CONTENT_TYPE_OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Status returned when the PATCH `Upload-Offset` does not match the server.
pub const STATUS_OFFSET_MISMATCH: u16 = 409;

/// Status returned when the `Upload-Checksum` does not match the body.
pub const STATUS_CHECKSUM_MISMATCH: u16 = 460;

/// Metadata key carrying the original file name.
pub const METADATA_FILENAME: &str = "filename";
