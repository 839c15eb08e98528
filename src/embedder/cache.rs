//! In-memory LRU cache for single-text (query) embeddings.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::Result;
use lru::LruCache;

use super::Embedder;

/// Wraps an embedder and memoizes single-input calls; batches pass straight through.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    /// Caches up to `capacity` query vectors; zero disables caching.
    pub fn new(inner: E, capacity: usize) -> Self {
        let cache = NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self { inner, cache }
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        let cache = self.cache.as_ref()?;
        let mut guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(key).cloned()
    }

    fn remember(&self, key: &str, vector: &[f32]) {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.put(key.to_string(), vector.to_vec());
        }
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let [single] = inputs else {
            return self.inner.embed_batch(inputs);
        };
        if let Some(hit) = self.lookup(single) {
            tracing::debug!("query embedding cache hit");
            return Ok(vec![hit]);
        }
        let vectors = self.inner.embed_batch(inputs)?;
        if let [vector] = vectors.as_slice() {
            self.remember(single, vector);
        }
        Ok(vectors)
    }
}
