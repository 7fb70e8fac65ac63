//! # Object Store Adapter
//!
//! Issues presigned upload/download handles for bodies that exceed the
//! control-channel frame budget (§4.3 `FMAX`), keyed by `request_id` under
//! the `requests/{id}/body` / `responses/{id}/body` prefixes (§6).

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;

pub fn request_key(request_id: &str) -> String {
    format!("requests/{request_id}/body")
}

pub fn response_key(request_id: &str) -> String {
    format!("responses/{request_id}/body")
}

/// Default presigned-handle lifetime: at least the 180s poll window, with
/// margin (§5 "Presigned object lifetime ≥ 30 min").
pub const DEFAULT_PRESIGN_LIFETIME: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// A presigned PUT handle for `key`, valid for `lifetime`.
    async fn presign_put(&self, key: &str, lifetime: Duration) -> Result<String, StoreError>;

    /// A presigned GET handle for `key`, valid for `lifetime`.
    async fn presign_get(&self, key: &str, lifetime: Duration) -> Result<String, StoreError>;

    /// Whether an object has been written to `key` yet (used to detect that
    /// a staged response is ready, or that an upload-notify fired).
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Fetches the full object. Used by the edge once a staged response's
    /// key is marked ready, and by the agent when a request body was staged.
    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Writes the full object. Used directly by local/dev backends and by
    /// tests; production agents instead PUT to the presigned URL over HTTP.
    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError>;
}

/// In-memory object store for tests and single-process dev deployments.
/// Presigned URLs are synthetic (`memory://{key}`) since there is no real
/// network boundary to cross in this backend.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn presign_put(&self, key: &str, _lifetime: Duration) -> Result<String, StoreError> {
        Ok(format!("memory://{key}"))
    }

    async fn presign_get(&self, key: &str, _lifetime: Duration) -> Result<String, StoreError> {
        Ok(format!("memory://{key}"))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.contains_key(key))
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.objects.insert(key.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_bytes_by_key() {
        let store = MemoryObjectStore::new();
        let key = request_key("r1");
        assert!(!store.exists(&key).await.unwrap());
        store.put_bytes(&key, b"hello".to_vec()).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get_bytes(&key).await.unwrap(), b"hello");
    }
}
