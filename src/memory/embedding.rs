//! Embedding providers
//!
//! - `FastEmbedProvider`: local multilingual-e5-small via fastembed (384
//!   dimensions, ~90MB, auto-downloads on first use)
//! - `HashingEmbedder`: deterministic bag-of-words feature hashing, no model
//!   files; useful offline and in tests

use crate::core::EmbeddingProvider;
use crate::error::{Error, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Model identity recorded for vectors produced by `FastEmbedProvider`
pub const E5_SMALL_MODEL_ID: &str = "multilingual-e5-small";

/// Local embedding service wrapping fastembed
#[derive(Clone)]
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
}

impl FastEmbedProvider {
    /// Create a new embedding service with multilingual-e5-small
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::MultilingualE5Small).with_show_download_progress(true),
        )
        .map_err(|e| Error::Embedding(format!("Failed to init embedding model: {}", e)))?;

        Ok(FastEmbedProvider {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn model_id(&self) -> &str {
        E5_SMALL_MODEL_ID
    }

    fn dimensions(&self) -> usize {
        384
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let embeddings = model
                .embed(vec![text], None)
                .map_err(|e| Error::Embedding(format!("Embedding error: {}", e)))?;
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| Error::Embedding("No embedding returned".into()))
        })
        .await
        .map_err(|e| Error::Internal(format!("Embedding task join error: {}", e)))?
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            model
                .embed(texts, None)
                .map_err(|e| Error::Embedding(format!("Batch embedding error: {}", e)))
        })
        .await
        .map_err(|e| Error::Internal(format!("Embedding task join error: {}", e)))?
    }
}

/// Feature-hashing embedder
///
/// Each lowercase token increments one bucket; the vector is L2-normalised so
/// cosine similarity is the overlap of the two token bags. All components are
/// non-negative, so scores fall in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    model_id: String,
}

impl HashingEmbedder {
    /// Create an embedder producing `dimensions`-long vectors
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        HashingEmbedder {
            dimensions,
            model_id: format!("feature-hash-sha256-v2-{}", dimensions),
        }
    }

    /// Embed synchronously
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            vector[bucket(&token, self.dimensions)] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

/// Bucket for a token: the first eight bytes of its SHA-256, little-endian
///
/// The digest is fixed across platforms and toolchains, so stored vectors
/// stay comparable under the same model id.
fn bucket(token: &str, dimensions: usize) -> usize {
    let digest = Sha256::digest(token.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % dimensions as u64) as usize
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// Split text into lowercase alphanumeric tokens (underscores kept)
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
