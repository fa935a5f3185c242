//! In-process similarity store
//!
//! Brute-force cosine search and token-overlap keyword matching over a single
//! collection. No persistence; used for local runs without PostgreSQL and in
//! tests.

use crate::core::{EmbeddingSpace, KeywordHit, Payload, ScoredRecord, SimilarityStore, StoredRecord};
use crate::error::{Error, Result};
use crate::memory::embedding::{cosine_similarity, tokenize};
use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Similarity store held in process memory
#[derive(Debug)]
pub struct InMemorySimilarityStore {
    collection: String,
    space: RwLock<Option<EmbeddingSpace>>,
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl InMemorySimilarityStore {
    /// Create an empty, unbound collection
    pub fn new(collection: impl Into<String>) -> Self {
        InMemorySimilarityStore {
            collection: collection.into(),
            space: RwLock::new(None),
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn bound_dimensions(&self) -> Result<usize> {
        self.space
            .read()
            .await
            .as_ref()
            .map(|s| s.dimensions)
            .ok_or_else(|| {
                Error::Store(format!(
                    "collection '{}' has no embedding model bound",
                    self.collection
                ))
            })
    }
}

/// Text of a payload field; string arrays are joined with spaces
fn field_text(payload: &Payload, field: &str) -> Option<String> {
    match payload.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    }
}

#[async_trait]
impl SimilarityStore for InMemorySimilarityStore {
    fn id(&self) -> &str {
        "in-memory"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    async fn bind_model(&self, space: &EmbeddingSpace) -> Result<()> {
        let mut bound = self.space.write().await;
        match bound.as_ref() {
            Some(existing) if existing != space => Err(Error::EmbeddingSpaceMismatch {
                collection: self.collection.clone(),
                expected: existing.to_string(),
                actual: space.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                *bound = Some(space.clone());
                Ok(())
            }
        }
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<()> {
        let dimensions = self.bound_dimensions().await?;
        if vector.len() != dimensions {
            return Err(Error::Store(format!(
                "vector has {} dimensions, collection '{}' expects {}",
                vector.len(),
                self.collection,
                dimensions
            )));
        }

        self.records.write().await.insert(
            id.to_string(),
            StoredRecord {
                id: id.to_string(),
                vector,
                payload,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        let dimensions = self.bound_dimensions().await?;
        if vector.len() != dimensions {
            return Err(Error::Store(format!(
                "query vector has {} dimensions, collection '{}' expects {}",
                vector.len(),
                self.collection,
                dimensions
            )));
        }

        let records = self.records.read().await;
        let mut scored: Vec<ScoredRecord> = records
            .values()
            .map(|r| ScoredRecord {
                id: r.id.clone(),
                score: cosine_similarity(vector, &r.vector),
                payload: r.payload.clone(),
                created_at: r.created_at,
            })
            .collect();

        // Equal scores keep the freshest records inside the cut-off
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn keyword_search(&self, field: &str, text: &str, limit: usize) -> Result<Vec<KeywordHit>> {
        let query: HashSet<String> = tokenize(text).collect();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.records.read().await;
        let mut hits: Vec<KeywordHit> = records
            .values()
            .filter_map(|r| {
                let value = field_text(&r.payload, field)?;
                let tokens: HashSet<String> = tokenize(&value).collect();
                let overlap = query.intersection(&tokens).count();
                (overlap > 0).then(|| KeywordHit {
                    id: r.id.clone(),
                    score: overlap as f32,
                    payload: r.payload.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn space(dimensions: usize) -> EmbeddingSpace {
        EmbeddingSpace {
            model_id: "test".into(),
            dimensions,
        }
    }

    fn payload(field: &str, value: serde_json::Value) -> Payload {
        let mut p = Payload::new();
        p.insert(field.to_string(), value);
        p
    }

    #[tokio::test]
    async fn test_bind_model_is_sticky() {
        let store = InMemorySimilarityStore::new("c");
        store.bind_model(&space(2)).await.unwrap();
        store.bind_model(&space(2)).await.unwrap();

        let err = store.bind_model(&space(3)).await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingSpaceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unbound_or_wrong_dimensions_rejected() {
        let store = InMemorySimilarityStore::new("c");
        assert!(store.upsert("a", vec![1.0, 0.0], Payload::new()).await.is_err());

        store.bind_model(&space(2)).await.unwrap();
        assert!(store.upsert("a", vec![1.0, 0.0, 0.0], Payload::new()).await.is_err());
        assert!(store.knn_search(&[1.0], 3).await.is_err());
    }

    #[tokio::test]
    async fn test_knn_orders_by_similarity() {
        let store = InMemorySimilarityStore::new("c");
        store.bind_model(&space(2)).await.unwrap();
        store.upsert("x", vec![1.0, 0.0], Payload::new()).await.unwrap();
        store.upsert("y", vec![0.0, 1.0], Payload::new()).await.unwrap();
        store.upsert("xy", vec![1.0, 1.0], Payload::new()).await.unwrap();

        let results = store.knn_search(&[1.0, 0.1], 2).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "xy"]);
        assert!(results[0].score > results[1].score);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_knn_ties_keep_freshest() {
        let store = InMemorySimilarityStore::new("c");
        store.bind_model(&space(2)).await.unwrap();
        for i in 0..8 {
            store.upsert(&format!("v{}", i), vec![1.0, 0.0], Payload::new()).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let results = store.knn_search(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["v7", "v6", "v5"]);
    }

    #[tokio::test]
    async fn test_keyword_search_counts_overlap() {
        let store = InMemorySimilarityStore::new("c");
        store.bind_model(&space(1)).await.unwrap();
        store
            .upsert("a", vec![1.0], payload("name", json!("sales.customer.CustomerID")))
            .await
            .unwrap();
        store
            .upsert("b", vec![1.0], payload("name", json!("sales.order.CustomerID order total")))
            .await
            .unwrap();
        store
            .upsert("c", vec![1.0], payload("other", json!("CustomerID")))
            .await
            .unwrap();

        let hits = store.keyword_search("name", "customerid order", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(hits[0].score, 2.0);

        assert!(store.keyword_search("name", "   ", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_reads_string_arrays() {
        let store = InMemorySimilarityStore::new("c");
        store.bind_model(&space(1)).await.unwrap();
        store
            .upsert("a", vec![1.0], payload("tags", json!(["finance", "revenue"])))
            .await
            .unwrap();

        let hits = store.keyword_search("tags", "Revenue", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
