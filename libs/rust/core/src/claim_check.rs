//! Claim-check encoder/decoder: big payloads go to the blob store, only a
//! small pointer crosses the bus. Publishing the pointer is the caller's
//! responsibility, which keeps this component pure.

use crate::blob::BlobStore;
use crate::error::CoordinationError;
use crate::types::{ClaimCheckPointer, POINTER_SCHEMA_VERSION};
use chrono::Utc;
use std::sync::Arc;

pub struct ClaimCheck {
    store: Arc<dyn BlobStore>,
}

impl ClaimCheck {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn write(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        fingerprint: &str,
    ) -> Result<ClaimCheckPointer, CoordinationError> {
        let size_bytes = bytes.len() as u64;
        self.store.put(bucket, key, bytes).await?;
        Ok(ClaimCheckPointer {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size_bytes,
            schema_version: POINTER_SCHEMA_VERSION,
            fingerprint: fingerprint.to_string(),
            produced_at: Utc::now(),
        })
    }

    /// Resolve a pointer back into bytes. A length disagreement with the
    /// pointer means a truncated or clobbered write and is surfaced as
    /// `SizeMismatch` rather than handed to the caller.
    pub async fn read(&self, pointer: &ClaimCheckPointer) -> Result<Vec<u8>, CoordinationError> {
        let bytes = self.store.get(&pointer.bucket, &pointer.key).await?;
        if bytes.len() as u64 != pointer.size_bytes {
            return Err(CoordinationError::SizeMismatch {
                key: pointer.key.clone(),
                expected: pointer.size_bytes,
                actual: bytes.len() as u64,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn claim_check() -> ClaimCheck {
        ClaimCheck::new(Arc::new(MemoryBlobStore::new()))
    }

    #[tokio::test]
    async fn roundtrip() {
        let cc = claim_check();
        let ptr = cc.write("models", "gru/weights.bin", vec![1, 2, 3], "fp-1").await.unwrap();
        assert_eq!(ptr.size_bytes, 3);
        assert_eq!(ptr.fingerprint, "fp-1");
        assert_eq!(cc.read(&ptr).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn roundtrip_empty_payload() {
        let cc = claim_check();
        let ptr = cc.write("models", "empty", Vec::new(), "fp-1").await.unwrap();
        assert_eq!(ptr.size_bytes, 0);
        assert!(cc.read(&ptr).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let cc = claim_check();
        let mut ptr = cc.write("models", "a", vec![0], "fp-1").await.unwrap();
        ptr.key = "b".into();
        match cc.read(&ptr).await {
            Err(CoordinationError::NotFound { bucket, key }) => {
                assert_eq!(bucket, "models");
                assert_eq!(key, "b");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_write_is_size_mismatch() {
        let store = Arc::new(MemoryBlobStore::new());
        let cc = ClaimCheck::new(store.clone());
        let ptr = cc.write("models", "w", vec![0; 10], "fp-1").await.unwrap();
        // Simulate a truncated write behind the pointer's back.
        store.put("models", "w", vec![0; 4]).await.unwrap();
        match cc.read(&ptr).await {
            Err(CoordinationError::SizeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 10);
                assert_eq!(actual, 4);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }
}
