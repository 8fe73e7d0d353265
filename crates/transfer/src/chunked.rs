use std::io::SeekFrom;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// A byte range read from a local file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Offset of the first byte after this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Builds an `Upload-Checksum` header value (`sha256 <base64 digest>`).
pub fn checksum_header(data: &[u8]) -> String {
    format!("sha256 {}", STANDARD.encode(Sha256::digest(data)))
}

/// Reads a file in fixed-size chunks at arbitrary offsets.
///
/// Reads never extend past the upload length, which is the file size at
/// open time unless pinned with [`ChunkReader::open_exact`].
pub struct ChunkReader {
    file: tokio::fs::File,
    chunk_size: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`DEFAULT_CHUNK_SIZE`] is used.
    pub async fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            file,
            chunk_size,
            file_size,
        })
    }

    /// Opens `path` for an upload declared as `total_bytes` long.
    ///
    /// Fails with an I/O error if the file no longer has that size.
    pub async fn open_exact(
        path: &Path,
        chunk_size: u64,
        total_bytes: u64,
    ) -> Result<Self, TransferError> {
        let reader = Self::open(path, chunk_size).await?;
        if reader.file_size != total_bytes {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes but the upload declared {total_bytes}",
                    path.display(),
                    reader.file_size
                ),
            )));
        }
        Ok(reader)
    }

    /// Reads the chunk starting at `offset`. Returns `None` at EOF.
    pub async fn read_at(&mut self, offset: u64) -> Result<Option<Chunk>, TransferError> {
        if offset >= self.file_size {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        let want = self.chunk_size.min(self.file_size - offset);
        let mut data = Vec::with_capacity(want as usize);
        (&mut self.file).take(want).read_to_end(&mut data).await?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Chunk { offset, data }))
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}
