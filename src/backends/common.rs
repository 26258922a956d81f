use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use crate::Result;
use crate::content::Content;

/// Base contract every backend implements.
///
/// Optional behaviour lives in the capability traits below; an adapter advertises
/// the ones it supports by overriding the matching `as_*` accessor.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Returns `false` for a missing key rather than an error.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Whole content of `key`; `FileNotFound` when absent.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Creates or overwrites `key`, returning the number of bytes written.
    async fn write(&self, key: &str, content: Content<'_>) -> Result<u64>;

    /// Removes `key`. Whether an absent key is an error is up to the adapter.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Moves the content of `source` to `target`.
    async fn rename(&self, source: &str, target: &str) -> Result<()>;

    /// Every stored key, in no particular order.
    async fn keys(&self) -> Result<HashSet<String>>;

    /// Last modification time in unix seconds.
    async fn mtime(&self, key: &str) -> Result<i64>;

    /// Always `false` on flat backends.
    async fn is_directory(&self, key: &str) -> Result<bool>;

    /// The adapter as a [`ChecksumCalculator`], if it is one.
    fn as_checksum_calculator(&self) -> Option<&dyn ChecksumCalculator> {
        None
    }

    /// The adapter as a [`SizeCalculator`], if it is one.
    fn as_size_calculator(&self) -> Option<&dyn SizeCalculator> {
        None
    }

    /// The adapter as a [`MetadataSupporter`], if it is one.
    fn as_metadata_supporter(&self) -> Option<&dyn MetadataSupporter> {
        None
    }

    /// The adapter as a [`ListKeysAware`], if it is one.
    fn as_list_keys_aware(&self) -> Option<&dyn ListKeysAware> {
        None
    }

    /// The adapter as a [`MimeTypeProvider`], if it is one.
    fn as_mime_type_provider(&self) -> Option<&dyn MimeTypeProvider> {
        None
    }
}

/// Checksums are computed when content is written and read back, never recomputed.
#[async_trait::async_trait]
pub trait ChecksumCalculator: Send + Sync {
    /// Hex MD5 of the stored content.
    async fn checksum(&self, key: &str) -> Result<String>;
}

/// Byte length of stored content.
#[async_trait::async_trait]
pub trait SizeCalculator: Send + Sync {
    /// Size of `key` in bytes.
    async fn size(&self, key: &str) -> Result<u64>;
}

/// Backend-native metadata, passed through uninterpreted.
#[async_trait::async_trait]
pub trait MetadataSupporter: Send + Sync {
    /// Metadata stored with `key`.
    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Replaces the metadata of `key`.
    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()>;
}

/// Result of a prefix listing. Flat backends always leave `dirs` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedKeys {
    /// Directories under the prefix.
    pub dirs: HashSet<String>,
    /// Stored keys starting with the prefix.
    pub keys: HashSet<String>,
}

/// Prefix listing.
#[async_trait::async_trait]
pub trait ListKeysAware: Send + Sync {
    /// Keys, and directories where the backend has them, starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<ListedKeys>;
}

/// Content type of stored objects.
#[async_trait::async_trait]
pub trait MimeTypeProvider: Send + Sync {
    /// Mime type of `key`, native where the backend records one, sniffed otherwise.
    async fn mime_type(&self, key: &str) -> Result<String>;
}

/// Which optional capabilities an adapter supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Implements [`ChecksumCalculator`].
    pub checksum: bool,
    /// Implements [`SizeCalculator`].
    pub size: bool,
    /// Implements [`MetadataSupporter`].
    pub metadata: bool,
    /// Implements [`ListKeysAware`].
    pub list_keys: bool,
    /// Implements [`MimeTypeProvider`].
    pub mime_type: bool,
}

impl Capabilities {
    /// Reads every `as_*` accessor of `adapter`.
    pub fn of(adapter: &dyn Adapter) -> Self {
        Self {
            checksum: adapter.as_checksum_calculator().is_some(),
            size: adapter.as_size_calculator().is_some(),
            metadata: adapter.as_metadata_supporter().is_some(),
            list_keys: adapter.as_list_keys_aware().is_some(),
            mime_type: adapter.as_mime_type_provider().is_some(),
        }
    }
}
