use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::trace;

use super::{UploadError, UploadStore};

/// Process local [`UploadStore`], for tests and development setups.
#[derive(Clone, Debug, Default)]
pub struct MemoryUploadStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl UploadStore for MemoryUploadStore {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<u64, UploadError> {
        let written = data.len() as u64;
        self.objects.write().await.insert(key.to_string(), data);
        trace!(key, written, "Uploaded object");
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, UploadError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), UploadError> {
        self.objects.write().await.remove(key);
        trace!(key, "Deleted object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, UploadError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
