//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use storage_adapter::{
    BLOB_NOT_FOUND, BlobCommitSettings, BlobProperties, BlobService, BlobServiceConnector,
    BlobServiceError, CONTAINER_ALREADY_EXISTS, CONTAINER_NOT_FOUND,
};

/// Single-connection in-memory SQLite pool; the database lives as long as the pool.
pub async fn sqlite_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

fn xml_error(code: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>{code}</Code>\
         <Message>mock</Message></Error>"
    )
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    properties: BlobProperties,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, BTreeMap<String, StoredBlob>>,
    staged: HashMap<(String, String, String), Bytes>,
}

/// In-process stand-in for a blob service.
///
/// Missing containers answer with an XML body only, missing blobs with the error
/// code header only, so both translation paths get exercised.
#[derive(Debug, Default)]
pub struct MockBlobService {
    state: Mutex<State>,
    pub calls: AtomicUsize,
    pub already_exists_responses: AtomicUsize,
    pub staged_blocks: AtomicUsize,
    pub fail_deletes: AtomicBool,
    pub fail_everything: AtomicBool,
}

impl MockBlobService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_containers(names: &[&str]) -> Arc<Self> {
        let service = Self::default();
        {
            let mut state = service.state.lock().unwrap();
            for name in names {
                state.containers.insert(name.to_string(), BTreeMap::new());
            }
        }
        Arc::new(service)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(name)
    }

    pub fn properties_of(&self, container: &str, blob: &str) -> Option<BlobProperties> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container)
            .and_then(|blobs| blobs.get(blob))
            .map(|stored| stored.properties.clone())
    }

    fn enter(&self) -> Result<(), BlobServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_everything.load(Ordering::SeqCst) {
            return Err(BlobServiceError::new(503, xml_error("ServerBusy")));
        }
        Ok(())
    }
}

fn container_not_found() -> BlobServiceError {
    BlobServiceError::new(404, xml_error(CONTAINER_NOT_FOUND))
}

fn blob_not_found() -> BlobServiceError {
    BlobServiceError::with_code(404, BLOB_NOT_FOUND)
}

#[async_trait]
impl BlobService for MockBlobService {
    async fn create_container(&self, container: &str) -> Result<(), BlobServiceError> {
        self.enter()?;
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(container) {
            self.already_exists_responses.fetch_add(1, Ordering::SeqCst);
            return Err(BlobServiceError::new(409, xml_error(CONTAINER_ALREADY_EXISTS)));
        }
        state.containers.insert(container.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<String>, BlobServiceError> {
        self.enter()?;
        Ok(self.state.lock().unwrap().containers.keys().cloned().collect())
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, BlobServiceError> {
        self.enter()?;
        let state = self.state.lock().unwrap();
        let blobs = state.containers.get(container).ok_or_else(container_not_found)?;
        Ok(blobs
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .cloned()
            .collect())
    }

    async fn get_blob(&self, container: &str, blob: &str) -> Result<Bytes, BlobServiceError> {
        self.enter()?;
        let state = self.state.lock().unwrap();
        let blobs = state.containers.get(container).ok_or_else(container_not_found)?;
        blobs
            .get(blob)
            .map(|stored| stored.data.clone())
            .ok_or_else(blob_not_found)
    }

    async fn get_blob_properties(
        &self,
        container: &str,
        blob: &str,
    ) -> Result<BlobProperties, BlobServiceError> {
        self.enter()?;
        let state = self.state.lock().unwrap();
        let blobs = state.containers.get(container).ok_or_else(container_not_found)?;
        blobs
            .get(blob)
            .map(|stored| stored.properties.clone())
            .ok_or_else(blob_not_found)
    }

    async fn put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<(), BlobServiceError> {
        self.enter()?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container) {
            return Err(container_not_found());
        }
        self.staged_blocks.fetch_add(1, Ordering::SeqCst);
        state.staged.insert(
            (container.to_string(), blob.to_string(), block_id.to_string()),
            data,
        );
        Ok(())
    }

    async fn put_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: Vec<String>,
        settings: BlobCommitSettings,
    ) -> Result<(), BlobServiceError> {
        self.enter()?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container) {
            return Err(container_not_found());
        }
        let mut data = BytesMut::new();
        for id in block_ids {
            let block = state
                .staged
                .remove(&(container.to_string(), blob.to_string(), id))
                .ok_or_else(|| BlobServiceError::with_code(400, "InvalidBlockList"))?;
            data.extend_from_slice(&block);
        }
        let data = data.freeze();
        let properties = BlobProperties {
            content_length: data.len() as u64,
            last_modified: Utc::now(),
            content_type: settings.content_type,
            content_md5: settings.content_md5,
            metadata: settings.metadata,
        };
        state
            .containers
            .get_mut(container)
            .ok_or_else(container_not_found)?
            .insert(blob.to_string(), StoredBlob { data, properties });
        Ok(())
    }

    async fn copy_blob(
        &self,
        container: &str,
        blob: &str,
        source_container: &str,
        source_blob: &str,
    ) -> Result<(), BlobServiceError> {
        self.enter()?;
        let mut state = self.state.lock().unwrap();
        let mut copied = state
            .containers
            .get(source_container)
            .ok_or_else(container_not_found)?
            .get(source_blob)
            .cloned()
            .ok_or_else(blob_not_found)?;
        copied.properties.last_modified = Utc::now();
        state
            .containers
            .get_mut(container)
            .ok_or_else(container_not_found)?
            .insert(blob.to_string(), copied);
        Ok(())
    }

    async fn delete_blob(&self, container: &str, blob: &str) -> Result<(), BlobServiceError> {
        self.enter()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobServiceError::new(500, xml_error("InternalError")));
        }
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .get_mut(container)
            .ok_or_else(container_not_found)?
            .remove(blob)
            .map(|_| ())
            .ok_or_else(blob_not_found)
    }

    async fn set_blob_metadata(
        &self,
        container: &str,
        blob: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), BlobServiceError> {
        self.enter()?;
        let mut state = self.state.lock().unwrap();
        let stored = state
            .containers
            .get_mut(container)
            .ok_or_else(container_not_found)?
            .get_mut(blob)
            .ok_or_else(blob_not_found)?;
        stored.properties.metadata = metadata;
        Ok(())
    }
}

/// Connector that counts how often the adapter asks for a client.
pub struct CountingConnector {
    pub service: Arc<MockBlobService>,
    pub connects: AtomicUsize,
    pub failures_left: AtomicUsize,
}

impl CountingConnector {
    pub fn new(service: Arc<MockBlobService>) -> Arc<Self> {
        Self::failing(service, 0)
    }

    /// Fails the first `failures` attempts.
    pub fn failing(service: Arc<MockBlobService>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            service,
            connects: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl BlobServiceConnector for CountingConnector {
    async fn connect(&self) -> Result<Arc<dyn BlobService>, BlobServiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(BlobServiceError::transport("credentials unavailable"));
        }
        Ok(self.service.clone())
    }
}
