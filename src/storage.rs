//! Object store interface.
//!
//! Video bytes live in an external object store consumed through this trait:
//! presigned PUT URLs for client-direct uploads, presigned GET URLs for
//! platforms that pull by URL, and ranged reads for chunked uploads. All
//! backend failures surface as `STORAGE_UNAVAILABLE`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, ErrorKind, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URL a client can PUT the object to directly.
    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// URL a platform can GET the object from (pull-style publish APIs).
    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Read the whole object.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes starting at `offset`; short reads happen at the tail.
    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Object size in bytes; errors if the object does not exist.
    async fn size(&self, key: &str) -> Result<u64>;
}

fn unavailable(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::StorageUnavailable, message)
}

/// In-memory store for tests and local development. Presigned URLs are
/// synthetic but stable, so adapters under test can carry them around.
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    base_url: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            base_url: "memory://store".to_string(),
        }
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects
            .write()
            .expect("store lock poisoned")
            .insert(key.to_string(), bytes);
    }

    pub fn remove(&self, key: &str) {
        self.objects
            .write()
            .expect("store lock poisoned")
            .remove(key);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn presigned_put_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "{}/{}?op=put&ttl={}",
            self.base_url,
            key,
            ttl.as_secs()
        ))
    }

    async fn presigned_get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "{}/{}?op=get&ttl={}",
            self.base_url,
            key,
            ttl.as_secs()
        ))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| unavailable(format!("object not found: {key}")))
    }

    async fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let objects = self.objects.read().expect("store lock poisoned");
        let bytes = objects
            .get(key)
            .ok_or_else(|| unavailable(format!("object not found: {key}")))?;
        let start = (offset as usize).min(bytes.len());
        let end = (offset.saturating_add(len) as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        self.objects
            .read()
            .expect("store lock poisoned")
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| unavailable(format!("object not found: {key}")))
    }
}
