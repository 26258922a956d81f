//! Local directory adapter.
//!
//! Keys are `/`-separated paths relative to the configured root. This is the one
//! hierarchical backend: directories are real, `is_directory` checks the disk and
//! `list_keys` reports sub-directories alongside files.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use walkdir::WalkDir;

use crate::backends::common::{
    Adapter, ListKeysAware, ListedKeys, MimeTypeProvider, SizeCalculator,
};
use crate::content::Content;
use crate::error::{StorageError, validate_key};
use crate::{Result, mime};

/// Staging files written beside their target are named `.storage-XXXXXX.tmp`.
const TEMP_PREFIX: &str = ".storage-";
const TEMP_SUFFIX: &str = ".tmp";

fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Where a [`LocalAdapter`] keeps its files.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Directory every key is resolved against.
    pub root: PathBuf,
    /// Create the root directory on first write instead of failing.
    pub create: bool,
}

impl LocalConfig {
    /// Files under `root`, created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            create: true,
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Adapter over a directory tree.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    config: LocalConfig,
}

struct Entry {
    key: String,
    is_dir: bool,
}

impl LocalAdapter {
    /// Builds the adapter; the root is checked lazily.
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    /// The configured root directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Maps a key onto a path under the root, refusing anything that could escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        if key.split('/').any(str::is_empty) {
            return Err(StorageError::invalid_key(key, "empty path segment"));
        }
        for component in Path::new(key).components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => {
                    return Err(StorageError::invalid_key(key, "parent directory reference"));
                }
                _ => return Err(StorageError::invalid_key(key, "key must be a relative path")),
            }
        }
        if key.rsplit('/').next().is_some_and(is_temp_file) {
            return Err(StorageError::invalid_key(key, "name is reserved for staging files"));
        }
        Ok(self.config.root.join(key))
    }

    async fn ensure_root(&self, operation: &'static str) -> Result<()> {
        let root = &self.config.root;
        let root_arg = root.to_string_lossy();
        let fail = |e: io::Error| StorageError::failure(operation, &[("root", &*root_arg)], e);
        if self.config.create {
            return tokio::fs::create_dir_all(root).await.map_err(fail);
        }
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(fail(io::Error::other("root is not a directory"))),
            Err(e) => Err(fail(e)),
        }
    }

    async fn file_metadata(&self, operation: &'static str, key: &str) -> Result<std::fs::Metadata> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta),
            Ok(_) => Err(StorageError::not_found(key)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::failure(operation, &[("key", key)], e)),
        }
    }

    /// Every entry under the root, walked on the blocking pool.
    async fn walk(&self, operation: &'static str) -> Result<Vec<Entry>> {
        let root = self.config.root.clone();
        let root_arg = root.to_string_lossy().into_owned();
        let fail = |e: Box<dyn std::error::Error + Send + Sync>| {
            StorageError::failure(operation, &[("root", root_arg.as_str())], e)
        };
        tokio::task::spawn_blocking(move || {
            let mut entries = vec![];
            if !root.is_dir() {
                return Ok(entries);
            }
            for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() && is_temp_file(&entry.file_name().to_string_lossy())
                {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(Entry {
                    key,
                    is_dir: entry.file_type().is_dir(),
                });
            }
            Ok::<_, walkdir::Error>(entries)
        })
        .await
        .map_err(|e| fail(e.into()))?
        .map_err(|e| fail(e.into()))
    }
}

#[async_trait::async_trait]
impl Adapter for LocalAdapter {
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.file_metadata("exists", key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        self.file_metadata("read", key).await?;
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(content.into()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::failure("read", &[("key", key)], e)),
        }
    }

    /// Streams into a temp file beside the target and renames it into place.
    #[instrument(skip(self, content))]
    async fn write(&self, key: &str, mut content: Content<'_>) -> Result<u64> {
        let path = self.path_for(key)?;
        self.ensure_root("write").await?;
        let fail = |e: io::Error| StorageError::failure("write", &[("key", key)], e);

        let parent = path.parent().unwrap_or(&self.config.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await.map_err(fail)?;
        let (temp, staged) = tokio::task::spawn_blocking(move || {
            let temp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&parent)?;
            let staged = temp.reopen()?;
            Ok::<_, io::Error>((temp, staged))
        })
        .await
        .map_err(|e| fail(io::Error::other(e)))?
        .map_err(fail)?;
        let mut file = tokio::fs::File::from_std(staged);

        let mut size = 0u64;
        let mut chunks = content.chunks();
        while let Some(chunk) = chunks.try_next().await.map_err(fail)? {
            file.write_all(&chunk).await.map_err(fail)?;
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(fail)?;
        drop(file);

        tokio::task::spawn_blocking(move || temp.persist(&path).map(drop).map_err(|e| e.error))
            .await
            .map_err(|e| fail(io::Error::other(e)))?
            .map_err(fail)?;
        Ok(size)
    }

    /// Deleting an absent file raises `FileNotFound`.
    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        self.file_metadata("delete", key).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::not_found(key)),
            Err(e) => Err(StorageError::failure("delete", &[("key", key)], e)),
        }
    }

    /// A filesystem rename, atomic within one volume.
    #[instrument(skip(self))]
    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let from = self.path_for(source)?;
        let to = self.path_for(target)?;
        self.file_metadata("rename", source).await?;
        let fail = |e: io::Error| {
            StorageError::failure("rename", &[("source", source), ("target", target)], e)
        };
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        tokio::fs::rename(&from, &to).await.map_err(fail)
    }

    async fn keys(&self) -> Result<HashSet<String>> {
        Ok(self
            .walk("keys")
            .await?
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.key)
            .collect())
    }

    async fn mtime(&self, key: &str) -> Result<i64> {
        let modified = self
            .file_metadata("mtime", key)
            .await?
            .modified()
            .map_err(|e| StorageError::failure("mtime", &[("key", key)], e))?;
        Ok(DateTime::<Utc>::from(modified).timestamp())
    }

    async fn is_directory(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::failure("is_directory", &[("key", key)], e)),
        }
    }

    fn as_size_calculator(&self) -> Option<&dyn SizeCalculator> {
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
impl SizeCalculator for LocalAdapter {
    async fn size(&self, key: &str) -> Result<u64> {
        Ok(self.file_metadata("size", key).await?.len())
    }
}

#[async_trait::async_trait]
impl ListKeysAware for LocalAdapter {
    async fn list_keys(&self, prefix: &str) -> Result<ListedKeys> {
        let mut listed = ListedKeys::default();
        for entry in self.walk("list_keys").await? {
            if !entry.key.starts_with(prefix) {
                continue;
            }
            if entry.is_dir {
                listed.dirs.insert(entry.key);
            } else {
                listed.keys.insert(entry.key);
            }
        }
        Ok(listed)
    }
}

#[async_trait::async_trait]
impl MimeTypeProvider for LocalAdapter {
    async fn mime_type(&self, key: &str) -> Result<String> {
        self.file_metadata("mime_type", key).await?;
        let path = self.path_for(key)?;
        let fail = |e: io::Error| StorageError::failure("mime_type", &[("key", key)], e);

        let file = tokio::fs::File::open(&path).await.map_err(fail)?;
        let mut head = Vec::with_capacity(mime::SNIFF_LEN);
        file.take(mime::SNIFF_LEN as u64)
            .read_to_end(&mut head)
            .await
            .map_err(fail)?;
        Ok(mime::sniff(key, &head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cannot_escape_the_root() {
        let adapter = LocalAdapter::new(LocalConfig::new("/srv/data"));
        assert_eq!(
            adapter.path_for("a/b.txt").unwrap(),
            PathBuf::from("/srv/data/a/b.txt")
        );
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", "a//b", "a/", "./a"] {
            assert!(
                adapter.path_for(key).unwrap_err().is_invalid_key(),
                "{key} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn missing_root_without_create_fails_writes() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalAdapter::new(LocalConfig {
            root: dir.path().join("absent"),
            create: false,
        });
        let err = adapter.write("k", "x".into()).await.unwrap_err();
        assert_eq!(err.operation(), Some("write"));
        assert!(adapter.keys().await.unwrap().is_empty());
    }
}
