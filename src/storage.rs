use crate::{domain::CacheStore, errors::CacheError, models::CacheEntry};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::PathBuf,
};
use tokio::{fs, sync::RwLock};
use tracing;
use uuid::Uuid;

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry<Value>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<Value>>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry<Value>) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn evict(&self, predicate: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync)) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !predicate(key));
        Ok(before - entries.len())
    }
}

/// Persists each entry as `<dir>/<encoded key>.json`, surviving restarts
/// the way browser local storage survives reloads.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

const ENTRY_EXTENSION: &str = "json";

impl FileCacheStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        tracing::info!(cache_dir = %dir.display(), "Initializing FileCacheStore");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), ENTRY_EXTENSION))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry<Value>>, CacheError> {
        let bytes = match fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn put(&self, key: &str, entry: CacheEntry<Value>) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&entry)?;
        // Write then rename so readers never see a half-written entry. Each write
        // gets its own tmp file; concurrent puts to one key race only on the rename.
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!("{}.{}.tmp", encode_key(key), Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn evict(&self, predicate: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync)) -> Result<usize, CacheError> {
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_key) else {
                continue;
            };
            if predicate(&key) {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

/// Keys may carry arbitrary slugs; anything outside `[A-Za-z0-9_-]` is `%XX`-escaped
/// so a key can never name a path outside the cache directory.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("image_hub_{}_{}", name, uuid::Uuid::new_v4().simple()))
    }

    #[test]
    fn key_encoding_escapes_path_characters() {
        let encoded = encode_key("image_hub_item_../etc/passwd");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('.'));
        assert_eq!(decode_key(&encoded).as_deref(), Some("image_hub_item_../etc/passwd"));
    }

    #[tokio::test]
    async fn memory_store_evicts_by_predicate() {
        let store = MemoryCacheStore::new();
        store.put("a1", CacheEntry::new(json!(1), 0)).await.unwrap();
        store.put("a2", CacheEntry::new(json!(2), 0)).await.unwrap();
        store.put("b1", CacheEntry::new(json!(3), 0)).await.unwrap();

        let removed = store.evict(&|k: &str| k.starts_with('a')).await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 1);
        assert!(store.get("b1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn file_store_persists_and_evicts() {
        let dir = scratch_dir("file_store");
        let store = FileCacheStore::open(&dir).await.unwrap();

        store.put("image_hub_item_cat", CacheEntry::new(json!({"slug": "cat"}), 42)).await.unwrap();
        store.put("unrelated", CacheEntry::new(json!(null), 1)).await.unwrap();

        let reopened = FileCacheStore::open(&dir).await.unwrap();
        let entry = reopened.get("image_hub_item_cat").await.unwrap().unwrap();
        assert_eq!(entry.timestamp, 42);
        assert_eq!(entry.data["slug"], "cat");

        let removed = reopened.evict(&|k: &str| k.starts_with("image_hub_item_")).await.unwrap();
        assert_eq!(removed, 1);
        assert!(reopened.get("image_hub_item_cat").await.unwrap().is_none());
        assert!(reopened.get("unrelated").await.unwrap().is_some());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_puts_to_one_key_all_succeed() {
        let dir = scratch_dir("concurrent");
        let store = FileCacheStore::open(&dir).await.unwrap();

        for round in 0..20 {
            let mut writers = tokio::task::JoinSet::new();
            for writer in 0..8 {
                let store = store.clone();
                writers.spawn(async move {
                    let rows: Vec<u32> = (0..200).map(|i| i + writer).collect();
                    store
                        .put("image_hub_list_cache", CacheEntry::new(json!(rows), round))
                        .await
                });
            }
            while let Some(result) = writers.join_next().await {
                result.unwrap().unwrap();
            }

            let entry = store.get("image_hub_list_cache").await.unwrap().unwrap();
            assert_eq!(entry.timestamp, round);
            assert_eq!(entry.data.as_array().unwrap().len(), 200);
        }

        let mut leftovers = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(item) = leftovers.next_entry().await.unwrap() {
            assert_ne!(item.path().extension().and_then(|e| e.to_str()), Some("tmp"));
        }

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_entry_is_an_error() {
        let dir = scratch_dir("corrupt");
        let store = FileCacheStore::open(&dir).await.unwrap();
        tokio::fs::write(store.path_for("broken"), b"{not json").await.unwrap();

        assert!(matches!(store.get("broken").await, Err(CacheError::Serde(_))));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
