//! `Upload-Metadata` header encoding.
//!
//! The header is a comma-separated list of `key base64(value)` pairs. Keys
//! must be non-empty and free of spaces and commas.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Errors produced while decoding an `Upload-Metadata` header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),

    #[error("invalid base64 value for key {0:?}")]
    InvalidValue(String),
}

/// Encodes a metadata map into an `Upload-Metadata` header value.
///
/// Entries are emitted in key order. Keys containing a space or a comma
/// cannot be represented and are rejected.
pub fn encode(metadata: &BTreeMap<String, String>) -> Result<String, MetadataError> {
    let mut parts = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        if key.is_empty() || key.contains([' ', ',']) {
            return Err(MetadataError::InvalidKey(key.clone()));
        }
        if value.is_empty() {
            parts.push(key.clone());
        } else {
            parts.push(format!("{key} {}", STANDARD.encode(value.as_bytes())));
        }
    }
    Ok(parts.join(","))
}

/// Decodes an `Upload-Metadata` header value.
pub fn decode(header: &str) -> Result<BTreeMap<String, String>, MetadataError> {
    let mut out = BTreeMap::new();
    for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once(' ') {
            Some((k, v)) => (k, v.trim()),
            None => (pair, ""),
        };
        if key.is_empty() {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        let value = if value.is_empty() {
            String::new()
        } else {
            let bytes = STANDARD
                .decode(value)
                .map_err(|_| MetadataError::InvalidValue(key.to_string()))?;
            String::from_utf8(bytes).map_err(|_| MetadataError::InvalidValue(key.to_string()))?
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}
