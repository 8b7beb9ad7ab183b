//! Bounded in-memory cache of loaded models.
//!
//! Capped by model count and by resident tensor bytes, with LRU eviction.
//! Loads are single-flight: concurrent requests for the same not-yet-cached
//! model share one download and one safetensors parse.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Device;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};

use crate::fetch::{FetchError, ModelFetcher};
use crate::manifest::ModelManifest;
use crate::model::{LoadedModel, ModelError};

/// Errors from cache loads.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model load task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Cache capacity limits.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of resident models.
    pub max_models: usize,
    /// Maximum resident tensor bytes across all models.
    pub max_memory_bytes: u64,
    /// Device to load weights onto.
    pub device: Device,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_models: 4,
            max_memory_bytes: 8 * 1024 * 1024 * 1024,
            device: Device::Cpu,
        }
    }
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub models_resident: usize,
    pub bytes_resident: u64,
}

type Slot = Arc<OnceCell<Arc<LoadedModel>>>;

struct CacheInner {
    slots: HashMap<String, Slot>,
    /// Most recently used at the end.
    lru: Vec<String>,
}

impl CacheInner {
    fn touch(&mut self, name: &str) {
        if let Some(pos) = self.lru.iter().position(|n| n == name) {
            let entry = self.lru.remove(pos);
            self.lru.push(entry);
        } else {
            self.lru.push(name.to_string());
        }
    }

    fn resident(&self) -> (usize, u64) {
        let mut count = 0;
        let mut bytes = 0;
        for slot in self.slots.values() {
            if let Some(model) = slot.get() {
                count += 1;
                bytes += model.size_bytes();
            }
        }
        (count, bytes)
    }

    /// Evict LRU-first until within limits, never evicting `keep`.
    fn enforce_limits(&mut self, config: &CacheConfig, keep: &str) {
        loop {
            let (count, bytes) = self.resident();
            if count <= config.max_models && bytes <= config.max_memory_bytes {
                return;
            }
            let victim = self
                .lru
                .iter()
                .find(|name| {
                    name.as_str() != keep
                        && self.slots.get(*name).is_some_and(|s| s.get().is_some())
                })
                .cloned();
            let Some(victim) = victim else {
                return;
            };
            tracing::info!(model = %victim, "evicting model from cache");
            self.slots.remove(&victim);
            self.lru.retain(|n| n != &victim);
        }
    }
}

/// The process-wide model cache.
pub struct ModelCache {
    fetcher: Arc<ModelFetcher>,
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ModelCache {
    pub fn new(fetcher: Arc<ModelFetcher>, config: CacheConfig) -> Self {
        Self {
            fetcher,
            config,
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
                lru: Vec::new(),
            }),
        }
    }

    /// Return the cached model for `manifest`, loading it if necessary.
    ///
    /// The fetch-and-parse runs at most once per model name regardless of
    /// how many callers arrive concurrently; latecomers await the same
    /// in-flight load.
    pub async fn get_or_load(
        &self,
        manifest: &ModelManifest,
    ) -> Result<Arc<LoadedModel>, CacheError> {
        let slot = {
            let mut inner = self.inner.lock().await;
            inner
                .slots
                .entry(manifest.name.clone())
                .or_default()
                .clone()
        };

        match slot.get_or_try_init(|| self.load(manifest)).await {
            Ok(model) => {
                let model = model.clone();
                let mut inner = self.inner.lock().await;
                // A failing racer may have dropped the slot; restore it.
                inner
                    .slots
                    .entry(manifest.name.clone())
                    .or_insert_with(|| slot.clone());
                inner.touch(&manifest.name);
                inner.enforce_limits(&self.config, &manifest.name);
                Ok(model)
            }
            Err(err) => {
                // Drop the still-empty slot so failed names do not
                // accumulate in the map.
                let mut inner = self.inner.lock().await;
                let empty = inner
                    .slots
                    .get(&manifest.name)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && s.get().is_none());
                if empty {
                    inner.slots.remove(&manifest.name);
                    inner.lru.retain(|n| n != &manifest.name);
                }
                Err(err)
            }
        }
    }

    async fn load(&self, manifest: &ModelManifest) -> Result<Arc<LoadedModel>, CacheError> {
        let path = self
            .fetcher
            .fetch_verified(&manifest.weights_uri, &manifest.weights_sha256)
            .await?;

        // safetensors parsing is synchronous; keep it off the event loop.
        let manifest = manifest.clone();
        let device = self.config.device.clone();
        let model = tokio::task::spawn_blocking(move || {
            LoadedModel::from_safetensors(&manifest, &path, &device)
        })
        .await??;

        tracing::info!(
            model = %model.name,
            version = model.version,
            tensors = model.num_tensors(),
            bytes = model.size_bytes(),
            "model loaded"
        );
        Ok(Arc::new(model))
    }

    /// Whether a model is currently resident.
    pub async fn contains(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.slots.get(name).is_some_and(|s| s.get().is_some())
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let (models_resident, bytes_resident) = inner.resident();
        CacheStats {
            models_resident,
            bytes_resident,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{sha256_hex, FetchConfig};
    use crate::manifest::ModelKind;
    use candle_core::Tensor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve `body` over HTTP for every request, counting hits.
    async fn spawn_server(body: Vec<u8>, hits: Arc<AtomicUsize>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}/w.safetensors")
    }

    fn safetensors_bytes(value: f32, len: usize) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let tensors: HashMap<String, Tensor> = [(
            "weight".to_string(),
            Tensor::full(value, len, &Device::Cpu).unwrap(),
        )]
        .into();
        candle_core::safetensors::save(&tensors, &path).unwrap();
        std::fs::read(&path).unwrap()
    }

    fn manifest_for(name: &str, uri: &str, sha256: &str) -> ModelManifest {
        ModelManifest {
            name: name.to_string(),
            version: 1,
            kind: ModelKind::Text,
            weights_uri: uri.to_string(),
            weights_sha256: sha256.to_string(),
            license: "MIT".to_string(),
            deltas: Vec::new(),
        }
    }

    fn test_cache(dir: &std::path::Path, config: CacheConfig) -> ModelCache {
        let fetcher = Arc::new(ModelFetcher::new(FetchConfig::new(dir)).unwrap());
        ModelCache::new(fetcher, config)
    }

    #[tokio::test]
    async fn loads_and_caches() {
        let body = safetensors_bytes(1.0, 8);
        let sha = sha256_hex(&body);
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(body, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), CacheConfig::default());
        let manifest = manifest_for("m", &url, &sha);

        let first = cache.get_or_load(&manifest).await.unwrap();
        let second = cache.get_or_load(&manifest).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.contains("m").await);
    }

    #[tokio::test]
    async fn concurrent_loads_are_single_flight() {
        let body = safetensors_bytes(2.0, 64);
        let sha = sha256_hex(&body);
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(body, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(dir.path(), CacheConfig::default()));
        let manifest = Arc::new(manifest_for("m", &url, &sha));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let manifest = manifest.clone();
            handles.push(tokio::spawn(
                async move { cache.get_or_load(&manifest).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(
            hits.load(Ordering::SeqCst),
            1,
            "all concurrent requests must share one download"
        );
    }

    #[tokio::test]
    async fn evicts_lru_beyond_max_models() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(
            dir.path(),
            CacheConfig {
                max_models: 2,
                ..Default::default()
            },
        );

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let body = safetensors_bytes(i as f32, 8 + i);
            let sha = sha256_hex(&body);
            let url = spawn_server(body, Arc::new(AtomicUsize::new(0))).await;
            cache
                .get_or_load(&manifest_for(name, &url, &sha))
                .await
                .unwrap();
        }

        assert!(!cache.contains("a").await, "oldest model must be evicted");
        assert!(cache.contains("b").await);
        assert!(cache.contains("c").await);
        assert_eq!(cache.stats().await.models_resident, 2);
    }

    #[tokio::test]
    async fn evicts_by_memory_budget() {
        let dir = tempfile::tempdir().unwrap();
        // Each model holds 64 f32 = 256 bytes; budget fits one model only.
        let cache = test_cache(
            dir.path(),
            CacheConfig {
                max_models: 10,
                max_memory_bytes: 300,
                ..Default::default()
            },
        );

        for (i, name) in ["a", "b"].iter().enumerate() {
            let body = safetensors_bytes(i as f32, 64);
            let sha = sha256_hex(&body);
            let url = spawn_server(body, Arc::new(AtomicUsize::new(0))).await;
            cache
                .get_or_load(&manifest_for(name, &url, &sha))
                .await
                .unwrap();
        }

        assert!(!cache.contains("a").await);
        assert!(cache.contains("b").await);
        let stats = cache.stats().await;
        assert_eq!(stats.models_resident, 1);
        assert_eq!(stats.bytes_resident, 256);
    }

    #[tokio::test]
    async fn failed_load_is_retryable() {
        let body = safetensors_bytes(1.0, 8);
        let wrong_sha = sha256_hex(b"different");
        let right_sha = sha256_hex(&body);
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_server(body, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), CacheConfig::default());

        let bad = manifest_for("m", &url, &wrong_sha);
        assert!(cache.get_or_load(&bad).await.is_err());
        assert!(!cache.contains("m").await);

        let good = manifest_for("m", &url, &right_sha);
        assert!(cache.get_or_load(&good).await.is_ok());
    }

    #[tokio::test]
    async fn failed_loads_leave_no_slot_behind() {
        let body = safetensors_bytes(1.0, 8);
        let wrong_sha = sha256_hex(b"different");
        let url = spawn_server(body, Arc::new(AtomicUsize::new(0))).await;

        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path(), CacheConfig::default());

        for i in 0..5 {
            let bad = manifest_for(&format!("m{i}"), &url, &wrong_sha);
            assert!(cache.get_or_load(&bad).await.is_err());
        }

        let inner = cache.inner.lock().await;
        assert!(inner.slots.is_empty(), "failed names must not accumulate");
        assert!(inner.lru.is_empty());
    }
}
