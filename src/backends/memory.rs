//! Process-local adapter used as the reference semantics in tests.
//!
//! Each call takes the map lock on its own; compound operations such as `rename`
//! are not serialised against each other, so concurrent callers need their own
//! synchronisation.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::instrument;

use crate::backends::common::{
    Adapter, ChecksumCalculator, ListKeysAware, ListedKeys, MetadataSupporter, MimeTypeProvider,
    SizeCalculator,
};
use crate::content::Content;
use crate::error::{StorageError, validate_key};
use crate::{Result, mime};

#[derive(Debug, Clone)]
struct StoredFile {
    content: Bytes,
    mtime: i64,
    checksum: String,
    metadata: HashMap<String, String>,
}

/// Adapter keeping every file in a process-local map.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    files: Mutex<HashMap<String, StoredFile>>,
}

impl InMemoryAdapter {
    /// An empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an adapter already holding the given files.
    pub fn with_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Bytes>,
    {
        let now = Utc::now().timestamp();
        let files = files
            .into_iter()
            .map(|(key, content)| {
                let content = content.into();
                let file = StoredFile {
                    checksum: format!("{:x}", md5::compute(&content)),
                    content,
                    mtime: now,
                    metadata: HashMap::new(),
                };
                (key.into(), file)
            })
            .collect();
        Self {
            files: Mutex::new(files),
        }
    }

    fn with_file<T>(&self, key: &str, f: impl FnOnce(&StoredFile) -> T) -> Result<T> {
        validate_key(key)?;
        self.files
            .lock()
            .get(key)
            .map(f)
            .ok_or_else(|| StorageError::not_found(key))
    }
}

#[async_trait::async_trait]
impl Adapter for InMemoryAdapter {
    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.files.lock().contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.with_file(key, |file| file.content.clone())
    }

    #[instrument(skip(self, content))]
    async fn write(&self, key: &str, mut content: Content<'_>) -> Result<u64> {
        validate_key(key)?;
        let content = content
            .read_all()
            .await
            .map_err(|e| StorageError::failure("write", &[("key", key)], e))?;
        let size = content.len() as u64;
        let checksum = format!("{:x}", md5::compute(&content));

        let mut files = self.files.lock();
        let metadata = files
            .remove(key)
            .map(|previous| previous.metadata)
            .unwrap_or_default();
        files.insert(
            key.to_string(),
            StoredFile {
                content,
                mtime: Utc::now().timestamp(),
                checksum,
                metadata,
            },
        );
        Ok(size)
    }

    /// Deleting an absent key succeeds.
    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.files.lock().remove(key);
        Ok(())
    }

    /// Read, delete, then write: correct for a single caller but not atomic.
    #[instrument(skip(self))]
    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        validate_key(target)?;
        let (content, metadata) =
            self.with_file(source, |file| (file.content.clone(), file.metadata.clone()))?;
        self.delete(source).await?;
        self.write(target, Content::Bytes(content)).await?;
        if !metadata.is_empty() {
            self.set_metadata(target, metadata).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }

    async fn mtime(&self, key: &str) -> Result<i64> {
        self.with_file(key, |file| file.mtime)
    }

    async fn is_directory(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
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
impl ChecksumCalculator for InMemoryAdapter {
    async fn checksum(&self, key: &str) -> Result<String> {
        self.with_file(key, |file| file.checksum.clone())
    }
}

#[async_trait::async_trait]
impl SizeCalculator for InMemoryAdapter {
    async fn size(&self, key: &str) -> Result<u64> {
        self.with_file(key, |file| file.content.len() as u64)
    }
}

#[async_trait::async_trait]
impl MetadataSupporter for InMemoryAdapter {
    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_file(key, |file| file.metadata.clone())
    }

    async fn set_metadata(&self, key: &str, metadata: HashMap<String, String>) -> Result<()> {
        validate_key(key)?;
        match self.files.lock().get_mut(key) {
            Some(file) => {
                file.metadata = metadata;
                Ok(())
            }
            None => Err(StorageError::not_found(key)),
        }
    }
}

#[async_trait::async_trait]
impl ListKeysAware for InMemoryAdapter {
    async fn list_keys(&self, prefix: &str) -> Result<ListedKeys> {
        let keys = self
            .files
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(ListedKeys {
            dirs: HashSet::new(),
            keys,
        })
    }
}

#[async_trait::async_trait]
impl MimeTypeProvider for InMemoryAdapter {
    async fn mime_type(&self, key: &str) -> Result<String> {
        self.with_file(key, |file| mime::sniff(key, &file.content))
    }
}
