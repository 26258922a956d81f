//! Azure-style blob container adapter.
//!
//! In single-container mode every key is a blob name inside one configured
//! container. In multi-container mode a key is `container/blob`, split at the
//! first `/`, and containers are created on demand when written to.

pub mod client;
pub mod errors;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, error, instrument};

use crate::backends::common::{
    Adapter, ChecksumCalculator, ListKeysAware, ListedKeys, MetadataSupporter, MimeTypeProvider,
    SizeCalculator,
};
use crate::content::Content;
use crate::error::{StorageError, validate_key};
use crate::{Result, mime};

use self::client::{BlobCommitSettings, BlobProperties, BlobService, BlobServiceConnector, Connected};
use self::errors::{ServiceErrorKind, translate};

/// Staged block size for uploads.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// How keys map onto containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerMode {
    /// All keys live in this container.
    Single(String),
    /// Keys carry their container as `container/blob`.
    Multi,
}

/// Settings of an [`AzureBlobAdapter`].
#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Container mapping.
    pub mode: ContainerMode,
    /// Sniff the payload for a content type when the caller supplies none.
    pub detect_content_type: bool,
    /// Size of staged upload blocks in bytes.
    pub block_size: usize,
}

impl AzureConfig {
    /// Every key is a blob in `container`.
    pub fn single(container: impl Into<String>) -> Self {
        Self {
            mode: ContainerMode::Single(container.into()),
            ..Self::default()
        }
    }

    /// Keys are `container/blob`.
    pub fn multi() -> Self {
        Self::default()
    }
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            mode: ContainerMode::Multi,
            detect_content_type: true,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Per-write blob properties.
#[derive(Debug, Clone, Default)]
pub struct BlobWriteOptions {
    /// Explicit content type; skips sniffing.
    pub content_type: Option<String>,
    /// Metadata committed with the blob.
    pub metadata: HashMap<String, String>,
}

/// Where a key lives on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobAddress<'a> {
    /// Container name.
    pub container: &'a str,
    /// Blob name within the container.
    pub blob: &'a str,
}

/// Splits a multi-container key at its first `/`.
pub fn tokenize_key(key: &str) -> Result<BlobAddress<'_>> {
    let Some((container, blob)) = key.split_once('/') else {
        return Err(StorageError::invalid_key(
            key,
            "expected <container>/<blob> in multi-container mode",
        ));
    };
    if container.is_empty() {
        return Err(StorageError::invalid_key(key, "container name is empty"));
    }
    if blob.is_empty() {
        return Err(StorageError::invalid_key(key, "blob name is empty"));
    }
    Ok(BlobAddress { container, blob })
}

/// Adapter over Azure-style blob containers.
pub struct AzureBlobAdapter {
    connector: Arc<dyn BlobServiceConnector>,
    service: OnceCell<Arc<dyn BlobService>>,
    config: AzureConfig,
}

impl AzureBlobAdapter {
    /// Builds the adapter without touching the network; the connector runs on first use.
    pub fn new(connector: Arc<dyn BlobServiceConnector>, config: AzureConfig) -> Self {
        Self {
            connector,
            service: OnceCell::new(),
            config,
        }
    }

    /// Builds the adapter around an existing client.
    pub fn with_service(service: Arc<dyn BlobService>, config: AzureConfig) -> Self {
        Self {
            connector: Arc::new(Connected(service.clone())),
            service: OnceCell::new_with(Some(service)),
            config,
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &AzureConfig {
        &self.config
    }

    fn is_multi(&self) -> bool {
        self.config.mode == ContainerMode::Multi
    }

    /// Connects once and memoises the client. A failed attempt is retried by the next call.
    pub async fn ensure_ready(&self) -> Result<&Arc<dyn BlobService>> {
        self.service
            .get_or_try_init(|| async {
                debug!("connecting to blob service");
                self.connector
                    .connect()
                    .await
                    .map_err(|e| StorageError::failure("connect", &[], e))
            })
            .await
    }

    fn address<'a>(&'a self, key: &'a str) -> Result<BlobAddress<'a>> {
        validate_key(key)?;
        match &self.config.mode {
            ContainerMode::Single(container) => Ok(BlobAddress {
                container: container.as_str(),
                blob: key,
            }),
            ContainerMode::Multi => tokenize_key(key),
        }
    }

    fn compose_key(&self, container: &str, blob: &str) -> String {
        match &self.config.mode {
            ContainerMode::Single(_) => blob.to_string(),
            ContainerMode::Multi => format!("{container}/{blob}"),
        }
    }

    /// Creates a container, treating "already exists" as success so racing writers
    /// both proceed.
    #[instrument(skip(self))]
    pub async fn create_container(&self, container: &str) -> Result<()> {
        let service = self.ensure_ready().await?;
        match service.create_container(container).await {
            Ok(()) => Ok(()),
            Err(e) if ServiceErrorKind::of(&e) == ServiceErrorKind::ContainerAlreadyExists => {
                debug!(container, "container already exists");
                Ok(())
            }
            Err(e) => Err(StorageError::failure(
                "create_container",
                &[("container", container)],
                e,
            )),
        }
    }

    async fn properties(&self, operation: &'static str, key: &str) -> Result<BlobProperties> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?;
        service
            .get_blob_properties(address.container, address.blob)
            .await
            .map_err(|e| translate(e, operation, key, &address, self.is_multi()))
    }

    async fn stage_block(
        &self,
        service: &dyn BlobService,
        key: &str,
        address: &BlobAddress<'_>,
        block_ids: &mut Vec<String>,
        data: Bytes,
    ) -> Result<()> {
        // ids must share one length within a blob
        let block_id = B64.encode((block_ids.len() as u32).to_be_bytes());
        service
            .put_block(address.container, address.blob, &block_id, data)
            .await
            .map_err(|e| translate(e, "write", key, address, self.is_multi()))?;
        block_ids.push(block_id);
        Ok(())
    }

    /// Writes `content` with explicit blob properties.
    ///
    /// Content is staged in blocks and becomes visible only when the block list is
    /// committed, so a failed upload leaves any previous blob untouched.
    #[instrument(skip(self, content, options))]
    pub async fn write_with(
        &self,
        key: &str,
        mut content: Content<'_>,
        options: BlobWriteOptions,
    ) -> Result<u64> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?.clone();
        if self.is_multi() {
            self.create_container(address.container).await?;
        }

        let detect = options.content_type.is_none() && self.config.detect_content_type;
        let block_size = self.config.block_size.max(1);
        let mut digest = md5::Context::new();
        let mut buffer = BytesMut::new();
        // sniffed independently of block boundaries
        let mut head = BytesMut::new();
        let mut block_ids = Vec::new();
        let mut size = 0u64;

        let mut chunks = content.chunks();
        while let Some(chunk) = chunks
            .try_next()
            .await
            .map_err(|e| StorageError::failure("write", &[("key", key)], e))?
        {
            digest.consume(&chunk);
            size += chunk.len() as u64;
            if detect && head.len() < mime::SNIFF_LEN {
                let wanted = (mime::SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..wanted]);
            }
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= block_size {
                let block = buffer.split_to(block_size).freeze();
                self.stage_block(service.as_ref(), key, &address, &mut block_ids, block)
                    .await?;
            }
        }
        let content_type = if detect {
            Some(mime::sniff(address.blob, &head))
        } else {
            options.content_type
        };
        if !buffer.is_empty() {
            self.stage_block(service.as_ref(), key, &address, &mut block_ids, buffer.freeze())
                .await?;
        }

        let settings = BlobCommitSettings {
            content_type,
            content_md5: Some(B64.encode(digest.compute().0)),
            metadata: options.metadata,
        };
        service
            .put_block_list(address.container, address.blob, block_ids, settings)
            .await
            .map_err(|e| translate(e, "write", key, &address, self.is_multi()))?;
        Ok(size)
    }

    async fn list_container(
        &self,
        service: &dyn BlobService,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>> {
        match service.list_blobs(container, prefix).await {
            Ok(blobs) => Ok(blobs),
            // a container removed between listing containers and listing blobs is empty
            Err(e)
                if self.is_multi()
                    && ServiceErrorKind::of(&e) == ServiceErrorKind::ContainerNotFound =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(StorageError::failure(
                "list_blobs",
                &[("container", container), ("prefix", prefix.unwrap_or_default())],
                e,
            )),
        }
    }

    async fn list_containers(&self, service: &dyn BlobService) -> Result<Vec<String>> {
        service
            .list_containers()
            .await
            .map_err(|e| StorageError::failure("list_containers", &[], e))
    }
}

#[async_trait::async_trait]
impl Adapter for AzureBlobAdapter {
    async fn exists(&self, key: &str) -> Result<bool> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?;
        match service
            .get_blob_properties(address.container, address.blob)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match ServiceErrorKind::of(&e) {
                ServiceErrorKind::BlobNotFound => Ok(false),
                ServiceErrorKind::ContainerNotFound if self.is_multi() => Ok(false),
                _ => Err(StorageError::failure(
                    "exists",
                    &[
                        ("key", key),
                        ("container", address.container),
                        ("blob", address.blob),
                    ],
                    e,
                )),
            },
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?;
        service
            .get_blob(address.container, address.blob)
            .await
            .map_err(|e| translate(e, "read", key, &address, self.is_multi()))
    }

    async fn write(&self, key: &str, content: Content<'_>) -> Result<u64> {
        self.write_with(key, content, BlobWriteOptions::default())
            .await
    }

    /// Deleting an absent blob raises `FileNotFound`.
    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?;
        service
            .delete_blob(address.container, address.blob)
            .await
            .map_err(|e| translate(e, "delete", key, &address, self.is_multi()))
    }

    /// Copy, then delete the source. The service has no move primitive: if the
    /// delete fails after the copy landed, both keys exist and the call reports a
    /// `StorageFailure`. Nothing is retried. Renaming a key onto itself is a no-op.
    #[instrument(skip(self))]
    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let from = self.address(source)?;
        let to = self.address(target)?;
        if from == to {
            // same address: nothing moves, the source only has to exist
            self.properties("rename", source).await?;
            return Ok(());
        }
        let service = self.ensure_ready().await?.clone();
        if self.is_multi() && from.container != to.container {
            self.create_container(to.container).await?;
        }

        service
            .copy_blob(to.container, to.blob, from.container, from.blob)
            .await
            .map_err(|e| translate(e, "rename", source, &from, self.is_multi()))?;

        match service.delete_blob(from.container, from.blob).await {
            Ok(()) => Ok(()),
            // someone else removed the source already
            Err(e) if ServiceErrorKind::of(&e) == ServiceErrorKind::BlobNotFound => Ok(()),
            Err(e) => {
                error!(
                    source,
                    target,
                    error = %e,
                    "rename copied the blob but could not delete the source; both keys now exist"
                );
                Err(StorageError::failure(
                    "rename",
                    &[("source", source), ("target", target)],
                    e,
                ))
            }
        }
    }

    async fn keys(&self) -> Result<HashSet<String>> {
        let service = self.ensure_ready().await?.clone();
        let containers = match &self.config.mode {
            ContainerMode::Single(container) => vec![container.clone()],
            ContainerMode::Multi => self.list_containers(service.as_ref()).await?,
        };

        let mut keys = HashSet::new();
        for container in containers {
            for blob in self.list_container(service.as_ref(), &container, None).await? {
                keys.insert(self.compose_key(&container, &blob));
            }
        }
        Ok(keys)
    }

    async fn mtime(&self, key: &str) -> Result<i64> {
        Ok(self.properties("mtime", key).await?.last_modified.timestamp())
    }

    async fn is_directory(&self, key: &str) -> Result<bool> {
        self.address(key)?;
        Ok(false)
    }

    fn as_checksum_calculator(&self) -> Option<&dyn ChecksumCalculator> {
        Some(self)
    }

    fn as_size_calculator(&self) -> Option<&dyn SizeCalculator> {
        Some(self)
    }

    fn as_metadata_supporter(&self) -> Option<&dyn MetadataSupporter> {
        Some(self)
    }

    fn as_list_keys_aware(&self) -> Option<&dyn ListKeysAware> {
        Some(self)
    }

    fn as_mime_type_provider(&self) -> Option<&dyn MimeTypeProvider> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ChecksumCalculator for AzureBlobAdapter {
    /// Hex form of the MD5 recorded when the blob was committed.
    async fn checksum(&self, key: &str) -> Result<String> {
        let properties = self.properties("checksum", key).await?;
        let fail = |e: Box<dyn std::error::Error + Send + Sync>| {
            StorageError::failure("checksum", &[("key", key)], e)
        };
        let encoded = properties
            .content_md5
            .ok_or_else(|| fail("blob has no Content-MD5".into()))?;
        let raw = B64.decode(encoded).map_err(|e| fail(e.into()))?;
        Ok(hex::encode(raw))
    }
}

#[async_trait::async_trait]
impl SizeCalculator for AzureBlobAdapter {
    async fn size(&self, key: &str) -> Result<u64> {
        Ok(self.properties("size", key).await?.content_length)
    }
}

#[async_trait::async_trait]
impl MetadataSupporter for AzureBlobAdapter {
    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.properties("get_metadata", key).await?.metadata)
    }

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()> {
        let address = self.address(key)?;
        let service = self.ensure_ready().await?;
        service
            .set_blob_metadata(address.container, address.blob, metadata)
            .await
            .map_err(|e| translate(e, "set_metadata", key, &address, self.is_multi()))
    }
}

#[async_trait::async_trait]
impl ListKeysAware for AzureBlobAdapter {
    async fn list_keys(&self, prefix: &str) -> Result<ListedKeys> {
        let service = self.ensure_ready().await?.clone();
        let mut keys = HashSet::new();

        match &self.config.mode {
            ContainerMode::Single(container) => {
                for blob in self
                    .list_container(service.as_ref(), container, Some(prefix))
                    .await?
                {
                    keys.insert(blob);
                }
            }
            ContainerMode::Multi => match prefix.split_once('/') {
                Some((container, blob_prefix)) => {
                    for blob in self
                        .list_container(service.as_ref(), container, Some(blob_prefix))
                        .await?
                    {
                        keys.insert(self.compose_key(container, &blob));
                    }
                }
                None => {
                    let containers = self.list_containers(service.as_ref()).await?;
                    for container in containers.iter().filter(|c| c.starts_with(prefix)) {
                        for blob in self.list_container(service.as_ref(), container, None).await? {
                            keys.insert(self.compose_key(container, &blob));
                        }
                    }
                }
            },
        }

        Ok(ListedKeys {
            dirs: HashSet::new(),
            keys,
        })
    }
}

#[async_trait::async_trait]
impl MimeTypeProvider for AzureBlobAdapter {
    async fn mime_type(&self, key: &str) -> Result<String> {
        let properties = self.properties("mime_type", key).await?;
        Ok(properties
            .content_type
            .unwrap_or_else(|| mime::OCTET_STREAM.to_string()))
    }
}

impl std::fmt::Debug for AzureBlobAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobAdapter")
            .field("config", &self.config)
            .field("connected", &self.service.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_at_first_slash() {
        let address = tokenize_key("container/dir/blob.txt").unwrap();
        assert_eq!(address.container, "container");
        assert_eq!(address.blob, "dir/blob.txt");
    }

    #[test]
    fn tokenize_rejects_malformed_keys() {
        for key in ["noslash", "/blob", "container/"] {
            let err = tokenize_key(key).unwrap_err();
            assert!(err.is_invalid_key(), "{key} should be invalid");
        }
    }

    #[test]
    fn single_mode_uses_whole_key_as_blob() {
        struct Unreachable;

        #[async_trait::async_trait]
        impl BlobServiceConnector for Unreachable {
            async fn connect(&self) -> std::result::Result<Arc<dyn BlobService>, client::BlobServiceError> {
                Err(client::BlobServiceError::transport("unreachable"))
            }
        }

        let adapter = AzureBlobAdapter::new(Arc::new(Unreachable), AzureConfig::single("box"));
        let address = adapter.address("no/slash/needed").unwrap();
        assert_eq!(address.container, "box");
        assert_eq!(address.blob, "no/slash/needed");
        assert_eq!(adapter.compose_key("box", "b"), "b");
    }
}
