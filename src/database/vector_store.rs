//! Similarity store backed by PostgreSQL + pgvector
//!
//! One table per collection (`oq_<collection>`) holding the vector, a JSONB
//! payload and the insert time. Nearest-neighbour search uses the cosine
//! operator; keyword search builds an OR'ed `tsquery` against one payload
//! field with the `simple` configuration.

use crate::core::{EmbeddingSpace, KeywordHit, Payload, ScoredRecord, SimilarityStore, StoredRecord};
use crate::database::PostgresPool;
use crate::error::{Error, Result};
use crate::memory::embedding::tokenize;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info};

/// pgvector-backed similarity store for one collection
#[derive(Clone)]
pub struct PgSimilarityStore {
    pool: PostgresPool,
    collection: String,
    table: String,
}

#[derive(FromRow)]
struct RecordRow {
    id: String,
    embedding: Vector,
    payload: Json<Payload>,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ScoredRow {
    id: String,
    payload: Json<Payload>,
    created_at: DateTime<Utc>,
    score: f32,
}

/// Collection names become table names, so only `[a-z0-9_]` is accepted
fn table_name(collection: &str) -> Result<String> {
    let valid = !collection.is_empty()
        && collection.len() <= 48
        && collection
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(Error::InvalidInput(format!(
            "collection name '{}' must match [a-z0-9_]{{1,48}}",
            collection
        )));
    }
    Ok(format!("oq_{}", collection))
}

/// OR'ed tsquery over the tokens of `text`, or `None` if there are none
fn or_tsquery(text: &str) -> Option<String> {
    let terms: Vec<String> = tokenize(text).collect();
    (!terms.is_empty()).then(|| terms.join(" | "))
}

impl PgSimilarityStore {
    /// Create a store handle for a collection
    pub fn new(pool: PostgresPool, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        let table = table_name(&collection)?;
        Ok(PgSimilarityStore {
            pool,
            collection,
            table,
        })
    }

    async fn ensure_table(&self, dimensions: usize) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                embedding vector({dimensions}) NOT NULL,
                payload JSONB NOT NULL DEFAULT '{{}}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
            table = self.table,
            dimensions = dimensions
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_embedding ON {table} \
             USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100)",
            table = self.table
        ))
        .execute(&self.pool)
        .await
        .ok(); // Ignore if not enough data or vector type not available

        Ok(())
    }
}

#[async_trait]
impl SimilarityStore for PgSimilarityStore {
    fn id(&self) -> &str {
        "pgvector"
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    async fn bind_model(&self, space: &EmbeddingSpace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_spaces (collection, model_id, dimensions)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection) DO NOTHING
        "#,
        )
        .bind(&self.collection)
        .bind(&space.model_id)
        .bind(space.dimensions as i32)
        .execute(&self.pool)
        .await?;

        let (model_id, dimensions): (String, i32) = sqlx::query_as(
            "SELECT model_id, dimensions FROM embedding_spaces WHERE collection = $1",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;

        let existing = EmbeddingSpace {
            model_id,
            dimensions: dimensions as usize,
        };
        if &existing != space {
            return Err(Error::EmbeddingSpaceMismatch {
                collection: self.collection.clone(),
                expected: existing.to_string(),
                actual: space.to_string(),
            });
        }

        self.ensure_table(space.dimensions).await?;
        info!(collection = %self.collection, space = %space, "Bound collection");
        Ok(())
    }

    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, embedding, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                payload = EXCLUDED.payload
        "#,
            self.table
        ))
        .bind(id)
        .bind(Vector::from(vector))
        .bind(Json(payload))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredRecord>> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT id, embedding, payload, created_at FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredRecord {
            id: r.id,
            vector: r.embedding.to_vec(),
            payload: r.payload.0,
            created_at: r.created_at,
        }))
    }

    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        let embedding = Vector::from(vector.to_vec());

        let rows: Vec<ScoredRow> = sqlx::query_as(&format!(
            r#"
            SELECT id, payload, created_at,
                   (1 - (embedding <=> $1))::REAL AS score
            FROM {}
            ORDER BY embedding <=> $1, created_at DESC
            LIMIT $2
        "#,
            self.table
        ))
        .bind(&embedding)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        debug!(collection = %self.collection, hits = rows.len(), "kNN search");
        Ok(rows
            .into_iter()
            .map(|r| ScoredRecord {
                id: r.id,
                score: r.score,
                payload: r.payload.0,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn keyword_search(&self, field: &str, text: &str, limit: usize) -> Result<Vec<KeywordHit>> {
        let Some(tsquery) = or_tsquery(text) else {
            return Ok(Vec::new());
        };

        let rows: Vec<ScoredRow> = sqlx::query_as(&format!(
            r#"
            SELECT id, payload, created_at,
                   ts_rank(to_tsvector('simple', COALESCE(payload->>$1, '')),
                           to_tsquery('simple', $2))::REAL AS score
            FROM {}
            WHERE to_tsvector('simple', COALESCE(payload->>$1, '')) @@ to_tsquery('simple', $2)
            ORDER BY score DESC, id
            LIMIT $3
        "#,
            self.table
        ))
        .bind(field)
        .bind(&tsquery)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| KeywordHit {
                id: r.id,
                score: r.score,
                payload: r.payload.0,
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert_eq!(table_name("query_cache").unwrap(), "oq_query_cache");
        assert!(table_name("Query").is_err());
        assert!(table_name("cache; DROP TABLE x").is_err());
        assert!(table_name("").is_err());
    }

    #[test]
    fn test_or_tsquery() {
        assert_eq!(
            or_tsquery("Top 10 'customers' & revenue").as_deref(),
            Some("top | 10 | customers | revenue")
        );
        assert_eq!(or_tsquery(" !? "), None);
    }
}
