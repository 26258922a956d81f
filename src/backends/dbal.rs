//! Relational adapter storing every file as one row of a single table.
//!
//! `write` checks for the key and then issues either an UPDATE or an INSERT. The
//! two statements are not wrapped in a transaction: concurrent writers of the same
//! key race. On the update path the last writer wins; two racing inserts hit the
//! primary key and the loser gets a `StorageFailure` carrying the driver's conflict.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::instrument;

use crate::Result;
use crate::backends::common::{
    Adapter, ChecksumCalculator, ListKeysAware, ListedKeys, SizeCalculator,
};
use crate::content::Content;
use crate::error::{StorageError, validate_key};

/// Table and column names used by [`DbalAdapter`].
#[derive(Debug, Clone)]
pub struct DbalConfig {
    /// Table holding one row per file.
    pub table: String,
    /// Text primary key.
    pub key_column: String,
    /// Blob column with the file content.
    pub content_column: String,
    /// Integer unix seconds of the last write.
    pub mtime_column: String,
    /// Hex MD5 of the content, written with it.
    pub checksum_column: String,
}

impl Default for DbalConfig {
    fn default() -> Self {
        Self {
            table: "files".to_string(),
            key_column: "key".to_string(),
            content_column: "content".to_string(),
            mtime_column: "mtime".to_string(),
            checksum_column: "checksum".to_string(),
        }
    }
}

/// SQL rendered once from the configured identifiers.
#[derive(Debug)]
struct Queries {
    create_table: String,
    count: String,
    select_content: String,
    select_mtime: String,
    select_checksum: String,
    select_size: String,
    select_keys: String,
    select_keys_like: String,
    insert: String,
    update: String,
    delete: String,
    rename: String,
}

impl Queries {
    fn new(config: &DbalConfig) -> Self {
        let table = quote_ident(&config.table);
        let key = quote_ident(&config.key_column);
        let content = quote_ident(&config.content_column);
        let mtime = quote_ident(&config.mtime_column);
        let checksum = quote_ident(&config.checksum_column);

        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} ({key} TEXT NOT NULL PRIMARY KEY, \
                 {content} BLOB NOT NULL, {mtime} INTEGER NOT NULL, {checksum} TEXT)"
            ),
            count: format!("SELECT COUNT(*) FROM {table} WHERE {key} = ?"),
            select_content: format!("SELECT {content} FROM {table} WHERE {key} = ?"),
            select_mtime: format!("SELECT {mtime} FROM {table} WHERE {key} = ?"),
            select_checksum: format!("SELECT {checksum} FROM {table} WHERE {key} = ?"),
            select_size: format!("SELECT LENGTH({content}) FROM {table} WHERE {key} = ?"),
            select_keys: format!("SELECT {key} FROM {table}"),
            select_keys_like: format!("SELECT {key} FROM {table} WHERE {key} LIKE ? ESCAPE '\\'"),
            insert: format!(
                "INSERT INTO {table} ({content}, {mtime}, {checksum}, {key}) VALUES (?, ?, ?, ?)"
            ),
            update: format!(
                "UPDATE {table} SET {content} = ?, {mtime} = ?, {checksum} = ? WHERE {key} = ?"
            ),
            delete: format!("DELETE FROM {table} WHERE {key} = ?"),
            rename: format!("UPDATE {table} SET {key} = ? WHERE {key} = ?"),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escapes LIKE wildcards so the prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Adapter storing files as rows of one SQLite table.
pub struct DbalAdapter {
    pool: SqlitePool,
    config: DbalConfig,
    queries: Queries,
}

impl DbalAdapter {
    /// Wraps an existing pool. The table is not touched until the first call.
    pub fn new(pool: SqlitePool, config: DbalConfig) -> Self {
        let queries = Queries::new(&config);
        Self {
            pool,
            config,
            queries,
        }
    }

    /// Table and column names in use.
    pub fn config(&self) -> &DbalConfig {
        &self.config
    }

    /// Creates the backing table if it does not exist yet.
    #[instrument(skip(self), fields(table = %self.config.table))]
    pub async fn create_table(&self) -> Result<()> {
        sqlx::query(&self.queries.create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StorageError::failure("create_table", &[("table", self.config.table.as_str())], e)
            })?;
        Ok(())
    }

    async fn count(&self, key: &str) -> std::result::Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(&self.queries.count)
            .bind(key)
            .fetch_one(&self.pool)
            .await
    }

    async fn insert(
        &self,
        key: &str,
        content: &[u8],
        mtime: i64,
        checksum: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(&self.queries.insert)
            .bind(content)
            .bind(mtime)
            .bind(checksum)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        key: &str,
        content: &[u8],
        mtime: i64,
        checksum: &str,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(&self.queries.update)
            .bind(content)
            .bind(mtime)
            .bind(checksum)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Adapter for DbalAdapter {
    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let count = self
            .count(key)
            .await
            .map_err(|e| StorageError::failure("exists", &[("key", key)], e))?;
        Ok(count > 0)
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;
        sqlx::query_scalar::<_, Vec<u8>>(&self.queries.select_content)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::failure("read", &[("key", key)], e))?
            .map(Bytes::from)
            .ok_or_else(|| StorageError::not_found(key))
    }

    #[instrument(skip(self, content))]
    async fn write(&self, key: &str, mut content: Content<'_>) -> Result<u64> {
        validate_key(key)?;
        let fail = |e: sqlx::Error| StorageError::failure("write", &[("key", key)], e);

        // the driver needs the whole payload as one bound parameter
        let content = content
            .read_all()
            .await
            .map_err(|e| StorageError::failure("write", &[("key", key)], e))?;
        let checksum = format!("{:x}", md5::compute(&content));
        let mtime = Utc::now().timestamp();

        if self.count(key).await.map_err(fail)? > 0 {
            self.update(key, &content, mtime, &checksum)
                .await
                .map_err(fail)?;
        } else {
            self.insert(key, &content, mtime, &checksum)
                .await
                .map_err(fail)?;
        }
        Ok(content.len() as u64)
    }

    /// Deleting an absent key raises `FileNotFound`.
    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let result = sqlx::query(&self.queries.delete)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::failure("delete", &[("key", key)], e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(key));
        }
        Ok(())
    }

    /// A single UPDATE of the key column; an existing target fails on the primary key.
    #[instrument(skip(self))]
    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        validate_key(source)?;
        validate_key(target)?;
        let result = sqlx::query(&self.queries.rename)
            .bind(target)
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                StorageError::failure("rename", &[("source", source), ("target", target)], e)
            })?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(source));
        }
        Ok(())
    }

    async fn keys(&self) -> Result<HashSet<String>> {
        let keys = sqlx::query_scalar::<_, String>(&self.queries.select_keys)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::failure("keys", &[("table", self.config.table.as_str())], e))?;
        Ok(keys.into_iter().collect())
    }

    async fn mtime(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        sqlx::query_scalar::<_, i64>(&self.queries.select_mtime)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::failure("mtime", &[("key", key)], e))?
            .ok_or_else(|| StorageError::not_found(key))
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

    fn as_list_keys_aware(&self) -> Option<&dyn ListKeysAware> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl ChecksumCalculator for DbalAdapter {
    async fn checksum(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        let fail = |e: Box<dyn std::error::Error + Send + Sync>| {
            StorageError::failure("checksum", &[("key", key)], e)
        };
        let stored = sqlx::query_scalar::<_, Option<String>>(&self.queries.select_checksum)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| fail(e.into()))?
            .ok_or_else(|| StorageError::not_found(key))?;
        // rows inserted behind the adapter's back may carry no checksum
        stored.ok_or_else(|| fail("no checksum stored for key".into()))
    }
}

#[async_trait::async_trait]
impl SizeCalculator for DbalAdapter {
    async fn size(&self, key: &str) -> Result<u64> {
        validate_key(key)?;
        let size = sqlx::query_scalar::<_, i64>(&self.queries.select_size)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::failure("size", &[("key", key)], e))?
            .ok_or_else(|| StorageError::not_found(key))?;
        Ok(size.max(0) as u64)
    }
}

#[async_trait::async_trait]
impl ListKeysAware for DbalAdapter {
    async fn list_keys(&self, prefix: &str) -> Result<ListedKeys> {
        let candidates = sqlx::query_scalar::<_, String>(&self.queries.select_keys_like)
            .bind(like_prefix(prefix))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::failure("list_keys", &[("prefix", prefix)], e))?;
        // LIKE ignores ASCII case on SQLite
        let keys = candidates
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        Ok(ListedKeys {
            dirs: HashSet::new(),
            keys,
        })
    }
}

impl std::fmt::Debug for DbalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbalAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn adapter() -> DbalAdapter {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let adapter = DbalAdapter::new(pool, DbalConfig::default());
        adapter.create_table().await.unwrap();
        adapter
    }

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("a_b%c\\"), "a\\_b\\%c\\\\%");
        assert_eq!(like_prefix(""), "%");
    }

    #[test]
    fn identifiers_are_quoted() {
        let queries = Queries::new(&DbalConfig {
            table: "my\"table".to_string(),
            ..DbalConfig::default()
        });
        assert_eq!(
            queries.delete,
            "DELETE FROM \"my\"\"table\" WHERE \"key\" = ?"
        );
    }

    #[tokio::test]
    async fn racing_inserts_surface_the_conflict() {
        let adapter = adapter().await;

        // both writers check before either inserts
        assert_eq!(adapter.count("k").await.unwrap(), 0);
        assert_eq!(adapter.count("k").await.unwrap(), 0);

        adapter.insert("k", b"first", 1, "c1").await.unwrap();
        let conflict = adapter
            .insert("k", b"second", 2, "c2")
            .await
            .map_err(|e| StorageError::failure("write", &[("key", "k")], e))
            .unwrap_err();
        assert!(conflict.is_storage_failure());
        assert_eq!(conflict.arg("key"), Some("k"));
        assert_eq!(adapter.read("k").await.unwrap(), "first");
    }

    #[tokio::test]
    async fn missing_table_is_a_storage_failure() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let adapter = DbalAdapter::new(pool, DbalConfig::default());
        let err = adapter.read("k").await.unwrap_err();
        assert_eq!(err.operation(), Some("read"));
        assert_eq!(err.arg("key"), Some("k"));
    }
}
