//! Blob store collaborator contract: byte payloads addressed by bucket+key.
//! The production store is external; `MemoryBlobStore` backs local runs and
//! tests.

use crate::error::CoordinationError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoordinationError>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoordinationError>;
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoordinationError> {
        self.objects.write().insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoordinationError> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CoordinationError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
