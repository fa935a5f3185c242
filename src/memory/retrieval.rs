//! Hybrid schema context retrieval
//!
//! Keyword matching and embedding similarity run over the same schema corpus,
//! concurrently and each under the lookup timeout. Keyword search catches
//! verbatim identifiers; semantic search catches paraphrases. The two
//! candidate lists are merged by source id and ranked by one fused score.

use crate::config::{FusionStrategy, RetrievalConfig};
use crate::core::{payload_str, EmbeddingProvider, Payload, SimilarityStore};
use crate::error::Result;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const KIND: &str = "schema_field";

/// Identifiers that must always be quoted
const RESERVED: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "case", "check", "column", "constraint",
    "create", "default", "desc", "distinct", "do", "else", "end", "except", "false", "for",
    "foreign", "from", "grant", "group", "having", "in", "intersect", "into", "is", "join",
    "limit", "not", "null", "offset", "on", "or", "order", "primary", "references", "select",
    "table", "then", "to", "true", "union", "unique", "user", "using", "when", "where",
    "window", "with",
];

/// Quote a PostgreSQL identifier only when it would not survive unquoted
///
/// Unquoted names fold to lower case, so `CustomerID` must be written
/// `"CustomerID"` while `customer` stays as is.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
        && !RESERVED.contains(&name);

    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// One column of the schema corpus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Schema name
    #[serde(alias = "table_schema")]
    pub schema: String,
    /// Table name
    #[serde(alias = "table_name")]
    pub table: String,
    /// Column name
    #[serde(alias = "column_name")]
    pub column: String,
    /// Column type
    #[serde(default)]
    pub data_type: String,
    /// What the column holds
    #[serde(default, alias = "inferred_column_description")]
    pub description: String,
    /// What the table holds
    #[serde(default, alias = "inferred_table_description")]
    pub table_description: String,
}

impl SchemaField {
    /// `schema.table.column`, unquoted
    pub fn source_id(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.column)
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Identifier exactly as it must appear in a query
    pub fn exact_usage(&self) -> String {
        format!(
            "{}.{}.{}",
            quote_ident(&self.schema),
            quote_ident(&self.table),
            quote_ident(&self.column)
        )
    }

    /// Descriptive line used for embedding and in the prompt
    pub fn text(&self) -> String {
        let mut text = format!("{} ({})", self.column, self.data_type);
        if !self.description.is_empty() {
            text.push_str(": ");
            text.push_str(&self.description);
        }
        text
    }

    fn embedding_text(&self) -> String {
        format!(
            "{} {}. {}",
            self.qualified_table(),
            self.text(),
            self.table_description
        )
    }

    fn payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("kind".into(), json!(KIND));
        payload.insert("full_column_name".into(), json!(self.source_id()));
        payload.insert("table".into(), json!(self.qualified_table()));
        payload.insert("table_description".into(), json!(self.table_description));
        payload.insert("description".into(), json!(self.description));
        payload.insert("text".into(), json!(self.text()));
        payload.insert("exact_usage".into(), json!(self.exact_usage()));
        payload
    }
}

/// A ranked piece of schema context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    /// `schema.table.column`
    pub source_id: String,
    /// `schema.table`, used for grouping
    pub table: String,
    /// What the table holds; may be empty
    #[serde(default)]
    pub table_description: String,
    /// Column description
    pub text: String,
    /// Identifier as it must be written
    pub exact_usage: String,
    /// Fused relevance; only comparable within one call
    pub relevance_score: f32,
}

impl ContextSnippet {
    fn from_payload(payload: &Payload, relevance_score: f32) -> Option<Self> {
        if payload_str(payload, "kind") != Some(KIND) {
            return None;
        }
        Some(ContextSnippet {
            source_id: payload_str(payload, "full_column_name")?.to_string(),
            table: payload_str(payload, "table").unwrap_or_default().to_string(),
            table_description: payload_str(payload, "table_description")
                .unwrap_or_default()
                .to_string(),
            text: payload_str(payload, "text").unwrap_or_default().to_string(),
            exact_usage: payload_str(payload, "exact_usage")?.to_string(),
            relevance_score,
        })
    }
}

/// Load a schema corpus from a JSON array of fields
pub fn load_schema_file(path: &Path) -> Result<Vec<SchemaField>> {
    let content = std::fs::read_to_string(path)?;
    let fields: Vec<SchemaField> = serde_json::from_str(&content)?;
    Ok(fields)
}

/// Render snippets grouped by table, in ranking order of first appearance
pub fn format_snippets(snippets: &[ContextSnippet]) -> String {
    let mut tables: Vec<(&str, Vec<&ContextSnippet>)> = Vec::new();
    for snippet in snippets {
        match tables.iter_mut().find(|(t, _)| *t == snippet.table) {
            Some((_, group)) => group.push(snippet),
            None => tables.push((snippet.table.as_str(), vec![snippet])),
        }
    }

    let mut out = String::new();
    for (table, group) in tables {
        out.push_str(&format!("Table: {}\n", table));
        // Any field of the table carries its description
        if let Some(description) = group
            .iter()
            .map(|s| s.table_description.trim())
            .find(|d| !d.is_empty())
        {
            out.push_str(&format!("Description: {}\n", description));
        }
        out.push_str("Columns:\n");
        for snippet in group {
            out.push_str(&format!("  - {}  -- {}\n", snippet.exact_usage, snippet.text));
        }
        out.push('\n');
    }
    out
}

/// Stable fingerprint of the schema fields behind an answer
///
/// Independent of ranking order; empty when no context was used.
pub fn context_fingerprint(snippets: &[ContextSnippet]) -> String {
    if snippets.is_empty() {
        return String::new();
    }
    let mut ids: Vec<&str> = snippets.iter().map(|s| s.source_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, ids.join("\n").as_bytes())
        .simple()
        .to_string()
}

#[derive(Default)]
struct Candidate {
    payload: Payload,
    keyword: Option<(f32, usize)>,
    semantic: Option<(f32, usize)>,
}

/// Hybrid keyword + semantic retriever over the schema corpus
#[derive(Clone)]
pub struct ContextRetriever {
    store: Arc<dyn SimilarityStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
    lookup_timeout: Duration,
}

impl ContextRetriever {
    /// Open the retriever, binding the corpus collection to the embedder's model
    pub async fn open(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn SimilarityStore>,
        config: RetrievalConfig,
        lookup_timeout: Duration,
    ) -> Result<Self> {
        store.bind_model(&embedder.space()).await?;
        Ok(ContextRetriever {
            store,
            embedder,
            config,
            lookup_timeout,
        })
    }

    /// Active settings
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Number of indexed records
    pub async fn corpus_size(&self) -> Result<usize> {
        self.store.count().await
    }

    /// Embed and upsert schema fields; re-indexing a field replaces it
    pub async fn index_fields(&self, fields: &[SchemaField]) -> Result<usize> {
        let concurrency = self.config.ingest_concurrency.max(1);

        let results: Vec<Result<()>> = stream::iter(fields)
            .map(|field| async move {
                let vector = self.embedder.embed(&field.embedding_text()).await?;
                self.store
                    .upsert(&field.source_id(), vector, field.payload())
                    .await
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut indexed = 0;
        for result in results {
            result?;
            indexed += 1;
        }

        info!(indexed, collection = self.store.collection(), "Indexed schema fields");
        Ok(indexed)
    }

    /// Top `top_n` snippets for a question, best first
    ///
    /// Never fails: a search that errors or times out contributes nothing.
    pub async fn retrieve(&self, question: &str, top_n: usize) -> Vec<ContextSnippet> {
        if top_n == 0 {
            return Vec::new();
        }
        let fetch = top_n * 3;

        let (keyword, semantic) = tokio::join!(
            tokio::time::timeout(self.lookup_timeout, self.keyword_candidates(question, fetch)),
            tokio::time::timeout(self.lookup_timeout, self.semantic_candidates(question, fetch)),
        );
        let keyword = degrade("keyword", keyword);
        let semantic = degrade("semantic", semantic);

        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for (rank, (id, score, payload)) in keyword.into_iter().enumerate() {
            let c = candidates.entry(id).or_default();
            c.payload = payload;
            c.keyword = Some((score, rank + 1));
        }
        for (rank, (id, score, payload)) in semantic.into_iter().enumerate() {
            let c = candidates.entry(id).or_default();
            c.payload = payload;
            c.semantic = Some((score.max(0.0), rank + 1));
        }

        let scores = self.fuse(&candidates);
        let mut snippets: Vec<ContextSnippet> = candidates
            .iter()
            .filter_map(|(id, c)| {
                let score = scores.get(id).copied().unwrap_or(0.0);
                (score > 0.0)
                    .then(|| ContextSnippet::from_payload(&c.payload, score))
                    .flatten()
            })
            .collect();

        snippets.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        snippets.truncate(top_n);

        if snippets.is_empty() {
            warn!("Retrieval degraded: no schema context for question");
        } else {
            debug!(snippets = snippets.len(), "Retrieved schema context");
        }
        snippets
    }

    /// Keyword hits summed across the configured fields, best first
    async fn keyword_candidates(&self, question: &str, limit: usize) -> Result<Vec<(String, f32, Payload)>> {
        let searches = self
            .config
            .keyword_fields
            .iter()
            .map(|field| self.store.keyword_search(field, question, limit));
        let per_field = futures::future::try_join_all(searches).await?;

        let mut merged: HashMap<String, (f32, Payload)> = HashMap::new();
        for hit in per_field.into_iter().flatten() {
            merged
                .entry(hit.id)
                .and_modify(|(score, _)| *score += hit.score)
                .or_insert((hit.score, hit.payload));
        }

        let mut ranked: Vec<(String, f32, Payload)> =
            merged.into_iter().map(|(id, (s, p))| (id, s, p)).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn semantic_candidates(&self, question: &str, limit: usize) -> Result<Vec<(String, f32, Payload)>> {
        let vector = self.embedder.embed(question).await?;
        let hits = self.store.knn_search(&vector, limit).await?;
        Ok(hits.into_iter().map(|r| (r.id, r.score, r.payload)).collect())
    }

    fn fuse(&self, candidates: &HashMap<String, Candidate>) -> HashMap<String, f32> {
        let (kw_weight, sem_weight) = (self.config.keyword_weight, self.config.semantic_weight);

        match self.config.fusion {
            FusionStrategy::WeightedScore => {
                let max_of = |pick: fn(&Candidate) -> Option<(f32, usize)>| {
                    candidates
                        .values()
                        .filter_map(|c| pick(c).map(|(s, _)| s))
                        .fold(0.0f32, f32::max)
                };
                let kw_max = max_of(|c: &Candidate| c.keyword);
                let sem_max = max_of(|c: &Candidate| c.semantic);
                let norm = |v: Option<(f32, usize)>, max: f32| match v {
                    Some((s, _)) if max > 0.0 => s / max,
                    _ => 0.0,
                };

                candidates
                    .iter()
                    .map(|(id, c)| {
                        let score =
                            kw_weight * norm(c.keyword, kw_max) + sem_weight * norm(c.semantic, sem_max);
                        (id.clone(), score)
                    })
                    .collect()
            }
            FusionStrategy::ReciprocalRank { rank_constant } => {
                let rrf = |v: Option<(f32, usize)>| match v {
                    // Zero-similarity neighbours are padding, not matches
                    Some((s, rank)) if s > 0.0 => 1.0 / (rank_constant + rank as f32),
                    _ => 0.0,
                };

                candidates
                    .iter()
                    .map(|(id, c)| {
                        let score = kw_weight * rrf(c.keyword) + sem_weight * rrf(c.semantic);
                        (id.clone(), score)
                    })
                    .collect()
            }
        }
    }
}

fn degrade<T>(
    search: &str,
    outcome: std::result::Result<Result<Vec<T>>, tokio::time::error::Elapsed>,
) -> Vec<T> {
    match outcome {
        Ok(Ok(hits)) => hits,
        Ok(Err(e)) => {
            warn!(search, error = %e, "Retrieval degraded: search failed");
            Vec::new()
        }
        Err(_) => {
            warn!(search, "Retrieval degraded: search timed out");
            Vec::new()
        }
    }
}
