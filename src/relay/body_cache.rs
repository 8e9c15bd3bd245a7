//! Request-body cache.
//!
//! Bodies up to `memory_threshold_bytes` are held as an in-process
//! `bytes::Bytes` slice; larger bodies spill to a temp file. `Open` always
//! returns a fresh, independent reader, and readers hold a refcount so the
//! janitor never deletes a body someone is still replaying across a retry.

use crate::config::{BodyCacheConfig, BodyCacheMode};
use crate::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLocation {
    Memory,
    Disk,
}

struct CacheEntry {
    size: u64,
    location: BodyLocation,
    sha256: String,
    created_at: DateTime<Utc>,
    last_access: RwLock<DateTime<Utc>>,
    refcount: AtomicUsize,
    memory: Option<Bytes>,
    path: Option<PathBuf>,
}

pub struct BodyCache {
    config: BodyCacheConfig,
    temp_dir: PathBuf,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    total_bytes: AtomicU64,
}

/// A checked-out reader. Holding this keeps the body's refcount above
/// zero; the janitor defers eviction until it drops to zero.
pub struct BodyHandle {
    entry: Arc<CacheEntry>,
}

impl BodyHandle {
    pub fn bytes(&self) -> GatewayResult<Bytes> {
        if let Some(data) = &self.entry.memory {
            return Ok(data.clone());
        }
        let path = self
            .entry
            .path
            .as_ref()
            .ok_or_else(|| GatewayError::CorruptedCache("entry has neither memory nor disk payload".into()))?;
        let bytes = std::fs::read(path).map_err(|e| {
            GatewayError::CorruptedCache(format!("failed to read cached body at {path:?}: {e}"))
        })?;
        Ok(Bytes::from(bytes))
    }
}

impl Drop for BodyHandle {
    fn drop(&mut self) {
        self.entry.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BodyCache {
    pub fn new(config: BodyCacheConfig, temp_dir: PathBuf) -> Self {
        Self {
            config,
            temp_dir,
            entries: RwLock::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
        }
    }

    /// Captures the full body, computing its SHA-256, and places it in
    /// memory or on disk per the configured mode/threshold.
    pub async fn put(&self, body: Bytes) -> GatewayResult<(String, u64)> {
        let size = body.len() as u64;
        let mut hasher = Sha256::new();
        hasher.update(&body);
        let sha256 = format!("{:x}", hasher.finalize());

        let use_disk = match self.config.mode {
            BodyCacheMode::Memory => false,
            BodyCacheMode::Disk => true,
            BodyCacheMode::Hybrid => size > self.config.memory_threshold_bytes,
        };

        let id = Uuid::new_v4().to_string();
        let entry = if use_disk {
            tokio::fs::create_dir_all(&self.temp_dir).await.ok();
            let path = self.temp_dir.join(&id);
            tokio::fs::write(&path, &body).await?;
            CacheEntry {
                size,
                location: BodyLocation::Disk,
                sha256,
                created_at: Utc::now(),
                last_access: RwLock::new(Utc::now()),
                refcount: AtomicUsize::new(0),
                memory: None,
                path: Some(path),
            }
        } else {
            CacheEntry {
                size,
                location: BodyLocation::Memory,
                sha256,
                created_at: Utc::now(),
                last_access: RwLock::new(Utc::now()),
                refcount: AtomicUsize::new(0),
                memory: Some(body),
                path: None,
            }
        };

        self.total_bytes.fetch_add(size, Ordering::SeqCst);
        self.entries.write().await.insert(id.clone(), Arc::new(entry));
        Ok((id, size))
    }

    /// Returns a fresh, independent handle on the body. Never returns a
    /// partial body: a missing disk file is reported as `CorruptedCache`
    /// and the entry is invalidated so a retry doesn't keep hitting it.
    pub async fn open(&self, cache_id: &str) -> GatewayResult<BodyHandle> {
        let entry = {
            let entries = self.entries.read().await;
            entries
                .get(cache_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("cache entry {cache_id}")))?
        };

        if entry.location == BodyLocation::Disk {
            if let Some(path) = &entry.path {
                if !path.exists() {
                    self.invalidate(cache_id).await;
                    return Err(GatewayError::CorruptedCache(format!(
                        "backing file missing for {cache_id}"
                    )));
                }
            }
        }

        entry.refcount.fetch_add(1, Ordering::SeqCst);
        *entry.last_access.write().await = Utc::now();
        Ok(BodyHandle { entry })
    }

    pub async fn sha256_of(&self, cache_id: &str) -> Option<String> {
        self.entries.read().await.get(cache_id).map(|e| e.sha256.clone())
    }

    /// Idempotent: invalidating an already-absent id is a no-op.
    pub async fn invalidate(&self, cache_id: &str) {
        let removed = self.entries.write().await.remove(cache_id);
        if let Some(entry) = removed {
            self.total_bytes.fetch_sub(entry.size, Ordering::SeqCst);
            if let Some(path) = &entry.path {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    pub async fn purge_all(&self) {
        let mut entries = self.entries.write().await;
        for (_, entry) in entries.drain() {
            if let Some(path) = &entry.path {
                let _ = std::fs::remove_file(path);
            }
        }
        self.total_bytes.store(0, Ordering::SeqCst);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Background janitor step: deletes entries older than `max_age`, then
    /// evicts LRU entries (refcount permitting) until under the watermark.
    pub async fn janitor_sweep(&self) {
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(self.config.max_age_secs as i64);

        let aged: Vec<String> = {
            let entries = self.entries.read().await;
            let mut out = Vec::new();
            for (id, entry) in entries.iter() {
                if now - entry.created_at > max_age {
                    out.push(id.clone());
                }
            }
            out
        };
        for id in aged {
            self.invalidate(&id).await;
        }

        let watermark = (self.config.max_bytes as f64 * self.config.high_watermark_ratio) as u64;
        if self.total_bytes() <= self.config.max_bytes {
            return;
        }

        let mut candidates: Vec<(String, DateTime<Utc>, usize)> = {
            let entries = self.entries.read().await;
            let mut out = Vec::new();
            for (id, entry) in entries.iter() {
                out.push((
                    id.clone(),
                    *entry.last_access.read().await,
                    entry.refcount.load(Ordering::SeqCst),
                ));
            }
            out
        };
        candidates.sort_by_key(|(_, last_access, _)| *last_access);

        for (id, _, refcount) in candidates {
            if self.total_bytes() <= watermark {
                break;
            }
            if refcount > 0 {
                debug!("deferring eviction of {id}: {refcount} open readers");
                continue;
            }
            self.invalidate(&id).await;
        }

        if self.total_bytes() > watermark {
            warn!("body cache still above watermark after janitor sweep: {} bytes", self.total_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(mode: BodyCacheMode, threshold: u64) -> BodyCache {
        let mut cfg = BodyCacheConfig::default();
        cfg.mode = mode;
        cfg.memory_threshold_bytes = threshold;
        BodyCache::new(cfg, std::env::temp_dir().join(format!("relay-test-{}", Uuid::new_v4())))
    }

    #[tokio::test]
    async fn roundtrip_memory_body() {
        let cache = cache(BodyCacheMode::Hybrid, 1024 * 1024);
        let body = Bytes::from_static(b"hello world");
        let (id, size) = cache.put(body.clone()).await.unwrap();
        assert_eq!(size, body.len() as u64);
        let handle = cache.open(&id).await.unwrap();
        assert_eq!(handle.bytes().unwrap(), body);
    }

    #[tokio::test]
    async fn roundtrip_disk_body() {
        let cache = cache(BodyCacheMode::Hybrid, 4);
        let body = Bytes::from_static(b"this body exceeds the tiny threshold");
        let (id, _) = cache.put(body.clone()).await.unwrap();
        let handle = cache.open(&id).await.unwrap();
        assert_eq!(handle.bytes().unwrap(), body);
        cache.invalidate(&id).await;
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let cache = cache(BodyCacheMode::Memory, 1024);
        let (id, _) = cache.put(Bytes::from_static(b"x")).await.unwrap();
        cache.invalidate(&id).await;
        cache.invalidate(&id).await;
        assert!(cache.open(&id).await.is_err());
    }

    #[tokio::test]
    async fn open_missing_disk_file_reports_corrupted_cache() {
        let cache = cache(BodyCacheMode::Disk, 0);
        let (id, _) = cache.put(Bytes::from_static(b"spill to disk")).await.unwrap();
        {
            let entries = cache.entries.read().await;
            if let Some(path) = &entries.get(&id).unwrap().path {
                std::fs::remove_file(path).unwrap();
            }
        }
        let result = cache.open(&id).await;
        assert!(matches!(result, Err(GatewayError::CorruptedCache(_))));
    }
}
