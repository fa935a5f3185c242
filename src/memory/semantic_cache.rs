//! Long-term semantic answer cache
//!
//! Question/answer pairs keyed by question embedding. A search never reuses an
//! answer on its own; it only proposes candidates above `min_score`, leaving
//! the decision to the caller.

use crate::config::CacheConfig;
use crate::core::{payload_str, EmbeddingProvider, Payload, ScoredRecord, SimilarityStore};
use crate::error::{Error, Result};
use crate::memory::embedding::cosine_similarity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const KIND: &str = "cache_entry";

/// A stored question/answer pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry ID
    pub entry_id: Uuid,
    /// Question as originally asked
    pub query_text: String,
    /// Embedding of the question
    pub query_embedding: Vec<f32>,
    /// Generated structured output
    pub answer_text: String,
    /// Fingerprint of the schema context used
    pub context_fingerprint: String,
    /// When the entry was written; never refreshed
    pub created_at: DateTime<Utc>,
}

/// A cache candidate for a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    /// Entry ID
    pub entry_id: Uuid,
    /// Cosine similarity in `[min_score, 1.0]`
    pub score: f32,
    /// Question the entry was created for
    pub query_text: String,
    /// Cached structured output
    pub answer_text: String,
    /// Fingerprint of the schema context used
    pub context_fingerprint: String,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

impl SimilarityMatch {
    fn from_scored(record: ScoredRecord) -> Option<Self> {
        Some(SimilarityMatch {
            entry_id: record.id.parse().ok()?,
            score: record.score.min(1.0),
            query_text: payload_str(&record.payload, "query_text")?.to_string(),
            answer_text: payload_str(&record.payload, "answer_text")?.to_string(),
            context_fingerprint: payload_str(&record.payload, "context_fingerprint")
                .unwrap_or_default()
                .to_string(),
            created_at: record.created_at,
        })
    }
}

/// Highest score first; equal scores prefer the fresher entry
fn rank(a: &SimilarityMatch, b: &SimilarityMatch) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.created_at.cmp(&a.created_at))
}

/// Semantic cache over a similarity store collection
#[derive(Clone)]
pub struct SemanticCache {
    store: Arc<dyn SimilarityStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: CacheConfig,
}

impl SemanticCache {
    /// Open the cache, binding the collection to the embedder's model
    pub async fn open(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn SimilarityStore>,
        config: CacheConfig,
    ) -> Result<Self> {
        store.bind_model(&embedder.space()).await?;
        info!(
            collection = store.collection(),
            model = embedder.model_id(),
            "Semantic cache ready"
        );
        Ok(SemanticCache {
            store,
            embedder,
            config,
        })
    }

    /// Active settings
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of stored entries
    pub async fn entry_count(&self) -> Result<usize> {
        self.store.count().await
    }

    /// Search with the configured `top_k` and `min_score`
    pub async fn search(&self, question: &str) -> Result<Vec<SimilarityMatch>> {
        self.search_with(question, self.config.top_k, self.config.min_score)
            .await
    }

    /// Candidates scoring at least `min_score`, best first, at most `top_k`
    ///
    /// An empty result is a plain cache miss.
    pub async fn search_with(
        &self,
        question: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<SimilarityMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(question).await?;
        // Over-fetch so freshness can break ties at the cut-off
        let candidates = self.store.knn_search(&vector, top_k * 2).await?;

        let mut matches: Vec<SimilarityMatch> = candidates
            .into_iter()
            .filter(|r| r.payload.get("kind").and_then(|v| v.as_str()) == Some(KIND))
            .filter_map(SimilarityMatch::from_scored)
            .filter(|m| m.score >= min_score)
            .collect();

        matches.sort_by(rank);
        matches.truncate(top_k);

        debug!(hits = matches.len(), min_score, "Semantic cache search");
        Ok(matches)
    }

    /// Insert a new entry; never deduplicates
    pub async fn store(
        &self,
        question: &str,
        structured_output: &str,
        context_fingerprint: &str,
    ) -> Result<Uuid> {
        let entry_id = Uuid::new_v4();
        let vector = self.embedder.embed(question).await?;

        let mut payload = Payload::new();
        payload.insert("kind".into(), json!(KIND));
        payload.insert("query_text".into(), json!(question));
        payload.insert("answer_text".into(), json!(structured_output));
        payload.insert("context_fingerprint".into(), json!(context_fingerprint));

        self.store
            .upsert(&entry_id.to_string(), vector, payload)
            .await?;

        debug!(%entry_id, "Cached answer");
        Ok(entry_id)
    }

    /// Fetch a stored entry by ID
    pub async fn entry(&self, entry_id: Uuid) -> Result<Option<CacheEntry>> {
        let Some(record) = self.store.get(&entry_id.to_string()).await? else {
            return Ok(None);
        };

        let field = |key: &str| -> Result<String> {
            payload_str(&record.payload, key)
                .map(String::from)
                .ok_or_else(|| Error::Store(format!("cache entry {} lacks '{}'", entry_id, key)))
        };

        Ok(Some(CacheEntry {
            entry_id,
            query_text: field("query_text")?,
            answer_text: field("answer_text")?,
            context_fingerprint: field("context_fingerprint").unwrap_or_default(),
            query_embedding: record.vector.clone(),
            created_at: record.created_at,
        }))
    }

    /// Fetch an entry and score it against `question`
    ///
    /// Used when a selection names an entry that was not part of a pending
    /// candidate list. The score is reported as-is, without the `min_score` cut.
    pub async fn lookup(&self, entry_id: Uuid, question: &str) -> Result<Option<SimilarityMatch>> {
        let Some(entry) = self.entry(entry_id).await? else {
            return Ok(None);
        };
        let vector = self.embedder.embed(question).await?;
        let score = cosine_similarity(&vector, &entry.query_embedding).clamp(0.0, 1.0);

        Ok(Some(SimilarityMatch {
            entry_id,
            score,
            query_text: entry.query_text,
            answer_text: entry.answer_text,
            context_fingerprint: entry.context_fingerprint,
            created_at: entry.created_at,
        }))
    }
}
