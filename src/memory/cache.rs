//! In-process caching for embeddings
//!
//! Uses moka async cache (Send + Sync, TTL-based eviction). Keys are scoped by
//! model identity so two embedders never share vectors.

use crate::core::EmbeddingProvider;
use crate::error::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Cache key helper: hash model identity and text to u64
fn hash_key(model_id: &str, text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    model_id.hash(&mut hasher);
    text.hash(&mut hasher);
    hasher.finish()
}

/// Embedding provider decorator that memoises vectors
#[derive(Clone)]
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    /// Embedding cache: hash(model + text) -> Vec<f32>
    embeddings: Cache<u64, Vec<f32>>,
}

impl CachedEmbedder {
    /// Wrap a provider with the default settings (1000 entries, 30 min TTL)
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_settings(inner, 1000, Duration::from_secs(30 * 60))
    }

    /// Wrap a provider with explicit capacity and TTL
    pub fn with_settings(inner: Arc<dyn EmbeddingProvider>, capacity: u64, ttl: Duration) -> Self {
        CachedEmbedder {
            inner,
            embeddings: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Get a cached embedding
    pub async fn get_cached(&self, text: &str) -> Option<Vec<f32>> {
        self.embeddings.get(&hash_key(self.inner.model_id(), text)).await
    }

    /// Number of cached vectors (approximate, moka counts lazily)
    pub fn cached_len(&self) -> u64 {
        self.embeddings.entry_count()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = hash_key(self.inner.model_id(), text);
        if let Some(cached) = self.embeddings.get(&key).await {
            trace!("Embedding cache hit");
            return Ok(cached);
        }

        let embedding = self.inner.embed(text).await?;
        self.embeddings.insert(key, embedding.clone()).await;
        Ok(embedding)
    }
}
