//! The narrow blob-service surface the Azure adapter is written against.
//!
//! A concrete client (SDK wrapper, REST client, test double) implements
//! [`BlobService`]; the adapter never builds or configures one itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A failed blob-service call as reported by the service.
///
/// `error_code` mirrors the `x-ms-error-code` header when the client exposes it;
/// otherwise the code is recovered from the XML `body`.
#[derive(Debug, Clone)]
pub struct BlobServiceError {
    /// HTTP status, or 0 when no response arrived.
    pub status: u16,
    /// Value of the error code header.
    pub error_code: Option<String>,
    /// Response body, or the transport error message.
    pub body: String,
}

impl BlobServiceError {
    /// An error whose code, if any, is in the XML body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            error_code: None,
            body: body.into(),
        }
    }

    /// An error carrying the code header.
    pub fn with_code(status: u16, code: impl Into<String>) -> Self {
        Self {
            status,
            error_code: Some(code.into()),
            body: String::new(),
        }
    }

    /// A failure that never produced an HTTP response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }
}

impl fmt::Display for BlobServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "blob service returned status {}: {code}", self.status),
            None if self.status == 0 => write!(f, "blob service unreachable: {}", self.body),
            None => write!(f, "blob service returned status {}", self.status),
        }
    }
}

impl std::error::Error for BlobServiceError {}

/// Properties of a committed blob.
#[derive(Debug, Clone, Default)]
pub struct BlobProperties {
    /// Size in bytes.
    pub content_length: u64,
    /// Time of the last commit or copy.
    pub last_modified: DateTime<Utc>,
    /// Content type, if one was set.
    pub content_type: Option<String>,
    /// Base64 of the raw MD5 digest, as the service stores it.
    pub content_md5: Option<String>,
    /// User metadata.
    pub metadata: HashMap<String, String>,
}

/// Properties applied when a block list is committed.
#[derive(Debug, Clone, Default)]
pub struct BlobCommitSettings {
    /// Content type to record.
    pub content_type: Option<String>,
    /// Base64 MD5 of the committed content.
    pub content_md5: Option<String>,
    /// User metadata to record.
    pub metadata: HashMap<String, String>,
}

/// Client operations the adapter needs.
#[async_trait::async_trait]
pub trait BlobService: Send + Sync {
    /// Creates `container`; fails with `ContainerAlreadyExists` if present.
    async fn create_container(&self, container: &str) -> Result<(), BlobServiceError>;

    /// Names of all containers.
    async fn list_containers(&self) -> Result<Vec<String>, BlobServiceError>;

    /// Blob names in `container`, optionally restricted to a name prefix.
    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, BlobServiceError>;

    /// Downloads a whole blob.
    async fn get_blob(&self, container: &str, blob: &str) -> Result<Bytes, BlobServiceError>;

    /// Reads blob properties without the content.
    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, BlobServiceError>;

    /// Stages an uncommitted block.
    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<(), BlobServiceError>;

    /// Atomically replaces the blob with the listed staged blocks.
    async fn put_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: Vec<String>,
        settings: BlobCommitSettings,
    ) -> Result<(), BlobServiceError>;

    /// Server-side copy of `source_container/source_blob` onto `container/blob`.
    async fn copy_blob(
        &self,
        container: &str,
        blob: &str,
        source_container: &str,
        source_blob: &str,
    ) -> Result<(), BlobServiceError>;

    /// Deletes a blob.
    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), BlobServiceError>;

    /// Replaces blob metadata.
    async fn set_blob_metadata(
        &self,
        container: &str,
        blob: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BlobServiceError>;
}

/// Produces the service client on first use.
#[async_trait::async_trait]
pub trait BlobServiceConnector: Send + Sync {
    /// Builds or fetches the client.
    async fn connect(&self) -> Result<Arc<dyn BlobService>, BlobServiceError>;
}

/// Connector for a client that already exists.
pub(crate) struct Connected(pub(crate) Arc<dyn BlobService>);

#[async_trait::async_trait]
impl BlobServiceConnector for Connected {
    async fn connect(&self) -> Result<Arc<dyn BlobService>, BlobServiceError> {
        Ok(self.0.clone())
    }
}
