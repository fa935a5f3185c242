//! Test doubles for the orchestrator

use crate::agent::orchestrator::Orchestrator;
use crate::config::{CacheConfig, OrchestratorConfig, RetrievalConfig};
use crate::core::{
    EmbeddingSpace, GenerationEngine, KeywordHit, Payload, ScoredRecord, SimilarityStore, StoredRecord,
};
use crate::database::InMemorySimilarityStore;
use crate::error::{Error, GenerationFailure, Result};
use crate::memory::{ContextRetriever, ConversationMemory, HashingEmbedder, SchemaField, SemanticCache};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays canned responses and records every prompt it sees
///
/// The last response repeats once the queue runs dry.
pub struct RecordingEngine {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingEngine {
    pub fn new<'a>(responses: impl IntoIterator<Item = &'a str>) -> Self {
        RecordingEngine {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for RecordingEngine {
    fn id(&self) -> &str {
        "recording"
    }

    async fn complete(&self, prompt: &str) -> std::result::Result<String, GenerationFailure> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        response.ok_or(GenerationFailure::EmptyResponse)
    }
}

/// Always fails the same way
pub struct FailingEngine(pub GenerationFailure);

#[async_trait]
impl GenerationEngine for FailingEngine {
    fn id(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _prompt: &str) -> std::result::Result<String, GenerationFailure> {
        Err(self.0.clone())
    }
}

/// Answers only after a delay
pub struct SlowEngine(pub Duration);

#[async_trait]
impl GenerationEngine for SlowEngine {
    fn id(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _prompt: &str) -> std::result::Result<String, GenerationFailure> {
        tokio::time::sleep(self.0).await;
        Ok("SELECT 1;".to_string())
    }
}

/// How a `FaultyStore` misbehaves
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Reads work, every write fails
    RejectWrites,
    /// kNN search returns an error
    FailSearch,
    /// kNN search never completes
    StallSearch,
}

/// In-memory store with one injected fault
pub struct FaultyStore {
    inner: InMemorySimilarityStore,
    fault: Fault,
}

impl FaultyStore {
    pub fn new(collection: &str, fault: Fault) -> Self {
        FaultyStore {
            inner: InMemorySimilarityStore::new(collection),
            fault,
        }
    }
}

#[async_trait]
impl SimilarityStore for FaultyStore {
    fn id(&self) -> &str {
        "faulty"
    }
    fn collection(&self) -> &str {
        self.inner.collection()
    }
    async fn bind_model(&self, space: &EmbeddingSpace) -> Result<()> {
        self.inner.bind_model(space).await
    }
    async fn upsert(&self, id: &str, vector: Vec<f32>, payload: Payload) -> Result<()> {
        match self.fault {
            Fault::RejectWrites => Err(Error::Store("collection is read-only".to_string())),
            _ => self.inner.upsert(id, vector, payload).await,
        }
    }
    async fn get(&self, id: &str) -> Result<Option<StoredRecord>> {
        self.inner.get(id).await
    }
    async fn knn_search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredRecord>> {
        match self.fault {
            Fault::FailSearch => Err(Error::Store("search backend unavailable".to_string())),
            Fault::StallSearch => std::future::pending().await,
            Fault::RejectWrites => self.inner.knn_search(vector, k).await,
        }
    }
    async fn keyword_search(&self, field: &str, text: &str, limit: usize) -> Result<Vec<KeywordHit>> {
        self.inner.keyword_search(field, text, limit).await
    }
    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// A small sales schema
pub fn schema_corpus() -> Vec<SchemaField> {
    let field = |table: &str, column: &str, data_type: &str, description: &str, table_description: &str| {
        SchemaField {
            schema: "sales".into(),
            table: table.into(),
            column: column.into(),
            data_type: data_type.into(),
            description: description.into(),
            table_description: table_description.into(),
        }
    };
    vec![
        field("customer", "CustomerID", "integer", "Unique customer identifier", "Customers of the shop"),
        field("customer", "revenue", "numeric", "Lifetime revenue of the customer", "Customers of the shop"),
        field("orders", "OrderDate", "date", "Day the order was placed", "Orders placed by customers"),
        field("orders", "TotalDue", "numeric", "Order total including tax", "Orders placed by customers"),
    ]
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub cache_store: Arc<dyn SimilarityStore>,
}

async fn build(
    engine: Arc<dyn GenerationEngine>,
    cache_store: Arc<dyn SimilarityStore>,
    config: OrchestratorConfig,
) -> Orchestrator {
    let embedder = Arc::new(HashingEmbedder::default());
    let cache = SemanticCache::open(embedder.clone(), cache_store, CacheConfig::default())
        .await
        .unwrap();
    let retriever = ContextRetriever::open(
        embedder,
        Arc::new(InMemorySimilarityStore::new("schema_fields")),
        RetrievalConfig::default(),
        config.lookup_timeout,
    )
    .await
    .unwrap();
    retriever.index_fields(&schema_corpus()).await.unwrap();

    Orchestrator::new(
        Arc::new(ConversationMemory::new()),
        cache,
        retriever,
        engine,
        config,
    )
    .unwrap()
}

/// Orchestrator over in-memory stores and the hashing embedder
pub async fn harness(engine: Arc<dyn GenerationEngine>, config: OrchestratorConfig) -> Harness {
    let cache_store: Arc<dyn SimilarityStore> = Arc::new(InMemorySimilarityStore::new("query_cache"));
    Harness {
        orchestrator: build(engine, cache_store.clone(), config).await,
        cache_store,
    }
}

/// Same as `harness`, over a caller-supplied cache store
pub async fn harness_with_cache_store(
    engine: Arc<dyn GenerationEngine>,
    cache_store: Arc<dyn SimilarityStore>,
    config: OrchestratorConfig,
) -> Harness {
    Harness {
        orchestrator: build(engine, cache_store.clone(), config).await,
        cache_store,
    }
}
