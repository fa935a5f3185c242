//! Storage traits - Abstract interfaces for similarity storage backends
//!
//! A `SimilarityStore` persists `(id, vector, payload)` records and answers
//! two kinds of queries over them:
//! - nearest-neighbour search by cosine similarity
//! - keyword search over a single payload field
//!
//! Two backends ship with the crate: PostgreSQL + pgvector for deployments and
//! an in-process store for local runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::Payload;
use crate::error::Result;

/// Identity of the embedding space a collection was built in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    /// Embedding model identity
    pub model_id: String,
    /// Vector length
    pub dimensions: usize,
}

impl std::fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}d)", self.model_id, self.dimensions)
    }
}

/// A stored record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Record ID
    pub id: String,
    /// Embedding vector
    pub vector: Vec<f32>,
    /// Associated payload
    pub payload: Payload,
    /// When the record was written
    pub created_at: DateTime<Utc>,
}

/// Result of a nearest-neighbour search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRecord {
    /// Record ID
    pub id: String,
    /// Cosine similarity to the query vector (higher is closer)
    pub score: f32,
    /// Associated payload
    pub payload: Payload,
    /// When the record was written
    pub created_at: DateTime<Utc>,
}

/// Result of a keyword search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordHit {
    /// Record ID
    pub id: String,
    /// Backend-specific relevance score (unbounded, higher is better)
    pub score: f32,
    /// Associated payload
    pub payload: Payload,
}

/// Abstract interface for vector + keyword storage
///
/// Every collection belongs to exactly one embedding space. Callers must
/// `bind_model` before writing or searching; a backend rejects a second,
/// different space for the same collection.
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Get the backend ID
    fn id(&self) -> &str;

    /// Collection this handle reads and writes
    fn collection(&self) -> &str;

    /// Record (or verify) the embedding space of the collection
    async fn bind_model(&self, space: &EmbeddingSpace) -> Result<()>;

    /// Insert or replace a record
    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<()>;

    /// Fetch a record by ID
    async fn get(&self, id: &str) -> Result<Option<StoredRecord>>;

    /// Top-`k` records by cosine similarity, most similar first
    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>>;

    /// Records whose payload `field` matches `text`, best first
    async fn keyword_search(&self, field: &str, text: &str, limit: usize) -> Result<Vec<KeywordHit>>;

    /// Number of records in the collection
    async fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_space_display() {
        let space = EmbeddingSpace {
            model_id: "multilingual-e5-small".into(),
            dimensions: 384,
        };
        assert_eq!(space.to_string(), "multilingual-e5-small (384d)");
    }
}
