//! Blob storage the result sink writes to.

use std::future::Future;

use thiserror::Error;

mod memory;

pub use memory::MemoryUploadStore;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Object '{0}' not found")]
    NotFound(String),

    #[error("Blob store request for '{key}' failed: {message}")]
    Backend { key: String, message: String },
}

/// Object storage keyed by string. Deleting a missing key is not an error.
pub trait UploadStore: Clone + Send + Sync + 'static {
    /// Stores `data` under `key`, replacing any existing object, and returns the
    /// number of bytes written.
    fn upload(&self, key: &str, data: Vec<u8>) -> impl Future<Output = Result<u64, UploadError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, UploadError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), UploadError>> + Send;

    /// Keys starting with `prefix`, in lexical order.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, UploadError>> + Send;
}

/// Deletes every object under `prefix` and returns how many were deleted.
pub async fn delete_prefix<U: UploadStore>(store: &U, prefix: &str) -> Result<usize, UploadError> {
    let keys = store.list(prefix).await?;
    for key in &keys {
        store.delete(key).await?;
    }
    Ok(keys.len())
}
