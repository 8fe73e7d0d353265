//! tus 1.0.0 transfer engine over HTTP.

use std::collections::BTreeMap;
use std::time::Duration;

use movor_protocol::constants::{
    CONTENT_TYPE_OFFSET_OCTET_STREAM, HEADER_TUS_RESUMABLE, HEADER_UPLOAD_CHECKSUM,
    HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET, STATUS_CHECKSUM_MISMATCH,
    STATUS_OFFSET_MISMATCH, TUS_VERSION,
};
use movor_protocol::metadata;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tracing::{debug, trace};

use crate::engine::{ChunkRequest, CreateRequest, TransferEngine, TransferFuture};
use crate::{ChunkReader, TransferError, checksum_header};

/// Longest response body excerpt carried in an error.
const MAX_ERROR_BODY: usize = 256;

/// [`TransferEngine`] speaking the tus resumable upload protocol.
///
/// Implements the core protocol plus the creation, termination and
/// (optionally) checksum extensions.
#[derive(Debug, Clone)]
pub struct HttpTransferEngine {
    client: reqwest::Client,
    checksum: bool,
}

impl HttpTransferEngine {
    /// Creates an engine using the given HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            checksum: false,
        }
    }

    /// Builds an engine with its own client and per-request timeouts.
    pub fn with_timeouts(
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("movor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransferError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::new(client))
    }

    /// Enables `Upload-Checksum` headers on chunk requests.
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<String, TransferError> {
        let endpoint = Url::parse(req.endpoint)
            .map_err(|e| TransferError::Protocol(format!("invalid endpoint {}: {e}", req.endpoint)))?;

        let mut builder = self
            .client
            .post(endpoint.clone())
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_LENGTH, req.total_bytes.to_string());
        if !req.metadata.is_empty() {
            let encoded =
                metadata::encode(req.metadata).map_err(|e| TransferError::Protocol(e.to_string()))?;
            builder = builder.header(HEADER_UPLOAD_METADATA, encoded);
        }
        let resp = with_headers(builder, req.headers).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransferError::Creation {
                status: status.as_u16(),
                message: error_body(resp).await,
            });
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransferError::Protocol("creation response without Location".into()))?;
        let resource = endpoint
            .join(location)
            .map_err(|e| TransferError::Protocol(format!("invalid Location {location}: {e}")))?;

        debug!(
            endpoint = %req.endpoint,
            resource = %resource,
            total_bytes = req.total_bytes,
            "upload resource created"
        );
        Ok(resource.to_string())
    }

    async fn head(
        &self,
        resource_url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<u64, TransferError> {
        let builder = self
            .client
            .head(resource_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION);
        let resp = with_headers(builder, headers).send().await?;

        let status = resp.status();
        if is_gone(status) {
            return Err(TransferError::NotFound(resource_url.to_string()));
        }
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                message: error_body(resp).await,
            });
        }

        let offset = upload_offset(&resp)?;
        debug!(resource = %resource_url, offset, "server offset queried");
        Ok(offset)
    }

    async fn patch(&self, req: ChunkRequest<'_>) -> Result<u64, TransferError> {
        let mut reader =
            ChunkReader::open_exact(req.file_path, req.chunk_size, req.total_bytes).await?;
        let chunk = reader.read_at(req.offset).await?.ok_or_else(|| {
            TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "no data at offset {} of {}",
                    req.offset,
                    req.file_path.display()
                ),
            ))
        })?;
        let len = chunk.data.len();

        let mut builder = self
            .client
            .patch(req.resource_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_OFFSET, req.offset.to_string())
            .header(CONTENT_TYPE, CONTENT_TYPE_OFFSET_OCTET_STREAM);
        if self.checksum {
            builder = builder.header(HEADER_UPLOAD_CHECKSUM, checksum_header(&chunk.data));
        }
        let resp = with_headers(builder, req.headers)
            .body(chunk.data)
            .send()
            .await?;

        let status = resp.status();
        match status.as_u16() {
            STATUS_OFFSET_MISMATCH => {
                return Err(TransferError::OffsetMismatch { offset: req.offset });
            }
            STATUS_CHECKSUM_MISMATCH => return Err(TransferError::ChecksumMismatch),
            _ => {}
        }
        if is_gone(status) {
            return Err(TransferError::NotFound(req.resource_url.to_string()));
        }
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
                message: error_body(resp).await,
            });
        }

        let offset = upload_offset(&resp)?;
        trace!(
            resource = %req.resource_url,
            from = req.offset,
            bytes = len,
            offset,
            "chunk acknowledged"
        );
        Ok(offset)
    }

    async fn delete(
        &self,
        resource_url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), TransferError> {
        let builder = self
            .client
            .delete(resource_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION);
        let resp = with_headers(builder, headers).send().await?;

        let status = resp.status();
        if status.is_success() || is_gone(status) {
            debug!(resource = %resource_url, "upload resource terminated");
            return Ok(());
        }
        Err(TransferError::Status {
            status: status.as_u16(),
            message: error_body(resp).await,
        })
    }
}

impl TransferEngine for HttpTransferEngine {
    fn create_remote_resource<'a>(&'a self, req: CreateRequest<'a>) -> TransferFuture<'a, String> {
        Box::pin(self.create(req))
    }

    fn query_offset<'a>(
        &'a self,
        resource_url: &'a str,
        headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, u64> {
        Box::pin(self.head(resource_url, headers))
    }

    fn send_chunk<'a>(&'a self, req: ChunkRequest<'a>) -> TransferFuture<'a, u64> {
        Box::pin(self.patch(req))
    }

    fn terminate<'a>(
        &'a self,
        resource_url: &'a str,
        headers: &'a BTreeMap<String, String>,
    ) -> TransferFuture<'a, ()> {
        Box::pin(self.delete(resource_url, headers))
    }
}

fn with_headers(mut builder: RequestBuilder, headers: &BTreeMap<String, String>) -> RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn is_gone(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

fn upload_offset(resp: &Response) -> Result<u64, TransferError> {
    resp.headers()
        .get(HEADER_UPLOAD_OFFSET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            TransferError::Protocol(format!(
                "response {} without a valid {HEADER_UPLOAD_OFFSET}",
                resp.status()
            ))
        })
}

async fn error_body(resp: Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    text.chars().take(MAX_ERROR_BODY).collect()
}
