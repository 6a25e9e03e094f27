use crate::errors::{CacheError, FetchError, MutationError};
use crate::models::{CacheEntry, ImageRecord, NewImage, UploadResponse};
use async_trait::async_trait;
use serde_json::Value;

/// Read side of the spreadsheet backend.
#[async_trait]
pub trait ImageSource: Send + Sync + 'static {
    /// Every record the backend knows about, in backend order.
    /// A payload that is not a JSON array yields an empty list.
    async fn list(&self) -> Result<Vec<ImageRecord>, FetchError>;

    /// Single record lookup. A backend "not found" reply maps to `FetchError::NotFound`.
    async fn by_slug(&self, slug: &str) -> Result<ImageRecord, FetchError>;
}

/// Write side, reached through the CORS proxy.
#[async_trait]
pub trait ImageWriter: Send + Sync + 'static {
    async fn upload(&self, file_name: &str, mime_type: &str, data: Vec<u8>) -> Result<UploadResponse, MutationError>;

    async fn create(&self, image: &NewImage) -> Result<ImageRecord, MutationError>;

    async fn delete(&self, id: &str) -> Result<(), MutationError>;
}

/// Key-value storage for cache entries. Payloads are kept as JSON so one store
/// can hold both the list and single records.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<Value>>, CacheError>;

    async fn put(&self, key: &str, entry: CacheEntry<Value>) -> Result<(), CacheError>;

    /// Removes every entry whose key matches; returns how many were removed.
    async fn evict(&self, predicate: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync)) -> Result<usize, CacheError>;
}

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
