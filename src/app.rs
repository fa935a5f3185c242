//! Wiring configuration into ready components
//!
//! With a `[database]` section both collections live in PostgreSQL; without
//! one they live in process memory and vanish on exit.

use crate::agent::{OpenRouterClient, Orchestrator, SchemaDescriber, TableSamples};
use crate::config::{Config, EmbeddingConfig, EmbeddingProviderKind};
use crate::core::{EmbeddingProvider, GenerationEngine, SimilarityStore};
use crate::database::{
    extract_schema_fields, init_pool, migrations, sample_rows, InMemorySimilarityStore,
    PgSimilarityStore, PostgresPool,
};
use crate::error::{Error, Result};
use crate::memory::{
    load_schema_file, CachedEmbedder, ContextRetriever, ConversationMemory, FastEmbedProvider,
    HashingEmbedder, SchemaField, SemanticCache,
};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Rows sampled per table when describing the schema
const DESCRIBE_SAMPLE_ROWS: usize = 5;

/// Where schema fields are ingested from
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// The configured database's catalog
    Database {
        /// Have the generation engine describe undocumented tables and columns
        describe: bool,
    },
    /// A JSON array of schema fields
    File(PathBuf),
}

/// Build the embedder named by the config, behind the embedding cache
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let inner: Arc<dyn EmbeddingProvider> = match config.provider {
        EmbeddingProviderKind::Fastembed => Arc::new(FastEmbedProvider::new()?),
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(config.hashing_dimensions)),
    };
    Ok(Arc::new(CachedEmbedder::with_settings(
        inner,
        config.cache_capacity,
        config.cache_ttl,
    )))
}

/// Long-lived application state shared by every request
pub struct App {
    config: Config,
    pool: Option<PostgresPool>,
    memory: Arc<ConversationMemory>,
    cache: SemanticCache,
    retriever: ContextRetriever,
}

impl App {
    /// Connect the stores and open the cache and retriever
    ///
    /// When the stores are in memory and `retrieval.schema_file` is set, the
    /// file is indexed before returning.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let embedder = build_embedder(&config.embedding)?;

        let pool = match &config.database {
            Some(db_config) => {
                let pool = init_pool(db_config).await?;
                migrations::run(&pool).await?;
                Some(pool)
            }
            None => {
                warn!("Database not configured. Cache and schema corpus live in memory.");
                None
            }
        };

        let (cache_store, corpus_store): (Arc<dyn SimilarityStore>, Arc<dyn SimilarityStore>) =
            match &pool {
                Some(pool) => (
                    Arc::new(PgSimilarityStore::new(pool.clone(), &config.cache.collection)?),
                    Arc::new(PgSimilarityStore::new(pool.clone(), &config.retrieval.collection)?),
                ),
                None => (
                    Arc::new(InMemorySimilarityStore::new(config.cache.collection.clone())),
                    Arc::new(InMemorySimilarityStore::new(config.retrieval.collection.clone())),
                ),
            };

        let cache = SemanticCache::open(embedder.clone(), cache_store, config.cache.clone()).await?;
        let retriever = ContextRetriever::open(
            embedder,
            corpus_store,
            config.retrieval.clone(),
            config.orchestrator.lookup_timeout,
        )
        .await?;

        let app = App {
            config,
            pool,
            memory: Arc::new(ConversationMemory::new()),
            cache,
            retriever,
        };

        if app.pool.is_none() {
            if let Some(path) = app.config.retrieval.schema_file.clone() {
                app.ingest(SchemaSource::File(path)).await?;
            }
        }

        info!(persistent = app.pool.is_some(), "OpenQuery ready");
        Ok(app)
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the stores are backed by PostgreSQL
    pub fn is_persistent(&self) -> bool {
        self.pool.is_some()
    }

    /// Semantic cache
    pub fn cache(&self) -> &SemanticCache {
        &self.cache
    }

    /// Context retriever
    pub fn retriever(&self) -> &ContextRetriever {
        &self.retriever
    }

    /// Orchestrator talking to OpenRouter
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        self.config.validate_for_generation()?;
        let client = OpenRouterClient::new(self.config.generation.clone())?;
        self.orchestrator_with_engine(Arc::new(client))
    }

    /// Orchestrator over any generation engine
    ///
    /// Orchestrators built from one `App` share conversation memory.
    pub fn orchestrator_with_engine(&self, engine: Arc<dyn GenerationEngine>) -> Result<Orchestrator> {
        Orchestrator::new(
            self.memory.clone(),
            self.cache.clone(),
            self.retriever.clone(),
            engine,
            self.config.orchestrator.clone(),
        )
    }

    /// Index schema fields into the corpus, returning how many were written
    pub async fn ingest(&self, source: SchemaSource) -> Result<usize> {
        let fields = match &source {
            SchemaSource::Database { describe } => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    Error::Config("ingesting from the database requires DATABASE_URL".to_string())
                })?;
                let fields = extract_schema_fields(pool, &self.config.retrieval.exclude_schemas).await?;
                if *describe {
                    self.describe_fields(pool, fields).await?
                } else {
                    fields
                }
            }
            SchemaSource::File(path) => load_schema_file(path)?,
        };

        if fields.is_empty() {
            warn!(?source, "No schema fields found");
            return Ok(0);
        }
        self.retriever.index_fields(&fields).await
    }

    /// Sample each table and let the generation engine fill in missing descriptions
    async fn describe_fields(&self, pool: &PostgresPool, fields: Vec<SchemaField>) -> Result<Vec<SchemaField>> {
        self.config.validate_for_generation()?;
        let client = OpenRouterClient::new(self.config.generation.clone())?;
        let describer = SchemaDescriber::new(
            Arc::new(client),
            self.config.retrieval.ingest_concurrency,
            self.config.orchestrator.generation_timeout,
        )?;

        let mut tables: Vec<(String, String)> = Vec::new();
        for field in &fields {
            let key = (field.schema.clone(), field.table.clone());
            if !tables.contains(&key) {
                tables.push(key);
            }
        }

        let samples: TableSamples = stream::iter(tables)
            .map(|(schema, table)| async move {
                let rows = sample_rows(pool, &schema, &table, DESCRIBE_SAMPLE_ROWS).await;
                (format!("{}.{}", schema, table), rows)
            })
            .buffer_unordered(self.config.retrieval.ingest_concurrency.max(1))
            .filter_map(|(table, rows)| async move {
                match rows {
                    Ok(rows) => Some((table, rows)),
                    Err(e) => {
                        warn!(table = %table, error = %e, "Could not sample table");
                        None
                    }
                }
            })
            .collect()
            .await;

        describer.describe(fields, &samples).await
    }
}
