//! Provider traits - Abstract interfaces for the model backends
//!
//! - `EmbeddingProvider`: text to fixed-length vector
//! - `GenerationEngine`: assembled prompt to raw draft answer
//!
//! Both are consumed through `Arc<dyn ...>` so tests can swap in stubs and
//! deployments can pick a backend from configuration.

use async_trait::async_trait;

use crate::core::storage::EmbeddingSpace;
use crate::error::{GenerationFailure, Result};

/// Abstract interface for embedding models
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identity of the model producing the vectors
    fn model_id(&self) -> &str;

    /// Vector length
    fn dimensions(&self) -> usize;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts; the default embeds them one by one
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Embedding space descriptor for store binding
    fn space(&self) -> EmbeddingSpace {
        EmbeddingSpace {
            model_id: self.model_id().to_string(),
            dimensions: self.dimensions(),
        }
    }
}

/// Abstract interface for the text generation service
///
/// Implementations apply their own retry policy; callers do not retry.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Engine identity for logs
    fn id(&self) -> &str;

    /// Complete a prompt, returning the raw model text
    async fn complete(&self, prompt: &str) -> std::result::Result<String, GenerationFailure>;
}
