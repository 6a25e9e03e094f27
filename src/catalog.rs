//! Cached access to the image catalog.
//!
//! Reads go through a TTL cache in front of the spreadsheet backend. The full list
//! lives under one key and single records under a per-slug key; a slug lookup is
//! answered from a fresh list before falling back to the network. Cache failures are
//! logged and otherwise ignored, so the cache can only ever save work.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing;

use crate::{
    domain::{CacheStore, Clock, ImageSource, ImageWriter},
    errors::{FetchError, MutationError},
    models::{sort_newest_first, CacheEntry, ImageRecord, NewImage, UploadResponse},
};

pub const CACHE_DURATION_MS: i64 = 10 * 60 * 1000;
pub const CACHE_KEY_LIST: &str = "image_hub_list_cache";
pub const CACHE_KEY_PREFIX: &str = "image_hub_item_";

pub fn item_key(slug: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{slug}")
}

/// Everything an operator supplies when publishing a new image.
#[derive(Debug, Clone)]
pub struct Publication {
    pub title: String,
    pub slug: String,
    pub download_url: Option<String>,
    pub description: Option<String>,
    pub uploaded_by: Option<String>,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct ImageCatalog {
    source: Arc<dyn ImageSource>,
    writer: Arc<dyn ImageWriter>,
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl ImageCatalog {
    pub fn new(
        source: Arc<dyn ImageSource>,
        writer: Arc<dyn ImageWriter>,
        cache: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            writer,
            cache,
            clock,
        }
    }

    /// All records, newest first.
    pub async fn fetch_list(&self) -> Result<Vec<ImageRecord>, FetchError> {
        if let Some(records) = self.cached::<Vec<ImageRecord>>(CACHE_KEY_LIST).await {
            tracing::debug!(count = records.len(), "Catalog: list served from cache");
            return Ok(records);
        }

        let mut records = self.source.list().await?;
        sort_newest_first(&mut records);
        self.store(CACHE_KEY_LIST, &records).await;

        tracing::info!(count = records.len(), "Catalog: list fetched from backend");
        Ok(records)
    }

    pub async fn fetch_by_slug(&self, slug: &str) -> Result<ImageRecord, FetchError> {
        let key = item_key(slug);
        if let Some(record) = self.cached::<ImageRecord>(&key).await {
            tracing::debug!(%slug, "Catalog: record served from item cache");
            return Ok(record);
        }

        // A fresh list is authoritative for slug lookups even if the item entry expired.
        if let Some(records) = self.cached::<Vec<ImageRecord>>(CACHE_KEY_LIST).await {
            if let Some(record) = records.into_iter().find(|r| r.slug == slug) {
                tracing::debug!(%slug, "Catalog: record served from list cache");
                self.store(&key, &record).await;
                return Ok(record);
            }
        }

        let record = self.source.by_slug(slug).await?;
        self.store(&key, &record).await;

        tracing::info!(%slug, id = %record.id, "Catalog: record fetched from backend");
        Ok(record)
    }

    /// Drops the list and every per-slug entry.
    pub async fn invalidate_cache(&self) {
        let is_catalog_key = |key: &str| key == CACHE_KEY_LIST || key.starts_with(CACHE_KEY_PREFIX);
        match self.cache.evict(&is_catalog_key).await {
            Ok(removed) => tracing::info!(removed, "Catalog: cache invalidated"),
            Err(e) => tracing::warn!(error = %e, "Catalog: Failed to clear cache"),
        }
    }

    pub async fn upload_image(&self, file_name: &str, mime_type: &str, data: Vec<u8>) -> Result<UploadResponse, MutationError> {
        self.writer.upload(file_name, mime_type, data).await
    }

    pub async fn create_image(&self, image: &NewImage) -> Result<ImageRecord, MutationError> {
        let record = self.writer.create(image).await?;
        self.invalidate_cache().await;
        Ok(record)
    }

    pub async fn delete_image(&self, id: &str) -> Result<(), MutationError> {
        self.writer.delete(id).await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Uploads the file to Drive, then records it in the sheet.
    pub async fn publish(&self, publication: Publication) -> Result<ImageRecord, MutationError> {
        let Publication {
            title,
            slug,
            download_url,
            description,
            uploaded_by,
            file_name,
            mime_type,
            data,
        } = publication;

        let uploaded = self.upload_image(&file_name, &mime_type, data).await?;

        let image = NewImage {
            title,
            slug,
            thumbnail_url: Some(uploaded.thumbnail_url).filter(|u| !u.is_empty()),
            drive_file_id: uploaded.drive_file_id,
            download_url,
            uploaded_by,
            description,
            file_type: Some(mime_type),
        };
        self.create_image(&image).await
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = match self.cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Catalog: cache read failed");
                return None;
            }
        };

        if !entry.is_fresh(self.clock.now_ms(), CACHE_DURATION_MS) {
            tracing::debug!(cache_key = %key, "Catalog: cache entry expired");
            self.remove(key).await;
            return None;
        }

        match serde_json::from_value(entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Catalog: unreadable cache entry");
                self.remove(key).await;
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) {
        let data = match serde_json::to_value(value) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "Failed to save to cache");
                return;
            }
        };
        if let Err(e) = self.cache.put(key, CacheEntry::new(data, self.clock.now_ms())).await {
            tracing::warn!(cache_key = %key, error = %e, "Failed to save to cache");
        }
    }

    async fn remove(&self, key: &str) {
        let target = key.to_string();
        if let Err(e) = self.cache.evict(&move |k: &str| k == target).await {
            tracing::warn!(cache_key = %key, error = %e, "Catalog: cache eviction failed");
        }
    }
}
