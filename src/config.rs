//! Configuration management for OpenQuery
//!
//! Layered loading: built-in defaults < config file (TOML or JSON5) < environment
//! variables (a `.env` file is honoured).

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Generation engine (OpenRouter chat completions) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// API key for OpenRouter
    pub api_key: SecretString,
    /// Model used to draft SQL
    pub model: String,
    /// Base URL for the OpenRouter API
    pub base_url: String,
    /// Site URL for rankings
    pub site_url: Option<String>,
    /// Site name for rankings
    pub site_name: Option<String>,
    /// Per-request HTTP timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retries on rate limiting before giving up
    pub max_retries: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum completion tokens
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        GenerationConfig {
            api_key: SecretString::from(""),
            model: "deepseek/deepseek-chat".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            site_url: None,
            site_name: None,
            request_timeout: Duration::from_secs(60),
            max_retries: 3,
            temperature: 0.1,
            max_tokens: 1000,
        }
    }
}

/// PostgreSQL database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: SecretString,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

/// Which embedding model backs the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local multilingual-e5-small via fastembed
    #[default]
    Fastembed,
    /// Deterministic feature hashing, no model download
    Hashing,
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fastembed" | "e5" => Ok(EmbeddingProviderKind::Fastembed),
            "hashing" | "hash" => Ok(EmbeddingProviderKind::Hashing),
            _ => Err(Error::Config(format!(
                "Invalid embedding provider: {}. Valid options: fastembed, hashing",
                s
            ))),
        }
    }
}

impl std::fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProviderKind::Fastembed => write!(f, "fastembed"),
            EmbeddingProviderKind::Hashing => write!(f, "hashing"),
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider
    pub provider: EmbeddingProviderKind,
    /// Vector size for the hashing provider
    pub hashing_dimensions: usize,
    /// Max cached embeddings
    pub cache_capacity: u64,
    /// Cached embedding lifetime
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: EmbeddingProviderKind::Fastembed,
            hashing_dimensions: 512,
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Semantic answer cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Similarity store collection holding question/answer pairs
    pub collection: String,
    /// Maximum candidates returned by a search
    pub top_k: usize,
    /// Minimum cosine similarity for a candidate to be offered
    pub min_score: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            collection: "query_cache".to_string(),
            top_k: 5,
            min_score: 0.7,
        }
    }
}

/// How keyword and semantic candidate lists are merged
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Weighted sum of max-normalised scores
    WeightedScore,
    /// Weighted reciprocal rank fusion
    ReciprocalRank {
        /// Rank damping constant
        #[serde(default = "default_rank_constant")]
        rank_constant: f32,
    },
}

impl Default for FusionStrategy {
    fn default() -> Self {
        FusionStrategy::WeightedScore
    }
}

fn default_rank_constant() -> f32 {
    60.0
}

/// Schema context retrieval configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Similarity store collection holding schema fields
    pub collection: String,
    /// Snippets handed to the prompt
    pub top_n: usize,
    /// Weight of the keyword score
    pub keyword_weight: f32,
    /// Weight of the semantic score
    pub semantic_weight: f32,
    /// Merge strategy
    pub fusion: FusionStrategy,
    /// Payload fields matched by keyword search
    pub keyword_fields: Vec<String>,
    /// Concurrent embeddings while indexing the corpus
    pub ingest_concurrency: usize,
    /// Schemas skipped when extracting from a live database
    pub exclude_schemas: Vec<String>,
    /// JSON schema corpus indexed at startup when the stores are in memory
    pub schema_file: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            collection: "schema_fields".to_string(),
            top_n: 10,
            keyword_weight: 1.0,
            semantic_weight: 1.0,
            fusion: FusionStrategy::WeightedScore,
            keyword_fields: vec![
                "full_column_name".to_string(),
                "description".to_string(),
                "table_description".to_string(),
            ],
            ingest_concurrency: 4,
            exclude_schemas: vec!["pg_catalog".to_string(), "information_schema".to_string()],
            schema_file: None,
        }
    }
}

/// Request pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Prior turns included in the prompt
    pub history_turns: usize,
    /// Upper bound on one generation call
    #[serde(with = "humantime_serde")]
    pub generation_timeout: Duration,
    /// Upper bound on cache search and context retrieval
    #[serde(with = "humantime_serde")]
    pub lookup_timeout: Duration,
    /// Sessions idle for longer than this are dropped
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            history_turns: 5,
            generation_timeout: Duration::from_secs(90),
            lookup_timeout: Duration::from_secs(3),
            session_idle_timeout: Duration::from_secs(60 * 60),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info,openquery=debug".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Generation engine settings
    pub generation: GenerationConfig,
    /// PostgreSQL settings; without them the stores live in process memory
    pub database: Option<DatabaseConfig>,
    /// Embedding settings
    pub embedding: EmbeddingConfig,
    /// Semantic cache settings
    pub cache: CacheConfig,
    /// Context retrieval settings
    pub retrieval: RetrievalConfig,
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Logging settings
    pub log: LogConfig,
}

/// Default config file location (`~/.config/openquery/config.toml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("openquery").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("openquery.toml"))
}

impl Config {
    /// Load from the default path (if present) and overlay the environment
    pub fn load() -> Result<Self> {
        let path = default_config_path();
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a specific path without environment overrides
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
            json5::from_str(&content)
                .map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
        } else {
            toml::from_str(&content)?
        };

        Ok(config)
    }

    /// Overlay environment variables (highest precedence)
    pub fn apply_env_overrides(&mut self) {
        dotenvy::dotenv().ok();

        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            self.generation.api_key = SecretString::from(key);
        }
        if let Ok(model) = std::env::var("OPENQUERY_MODEL").or_else(|_| std::env::var("DEFAULT_MODEL")) {
            self.generation.model = model;
        }
        if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
            self.generation.base_url = url;
        }
        if let Some(secs) = env_parse::<u64>("GENERATION_TIMEOUT_SECS") {
            self.orchestrator.generation_timeout = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            let max_connections = env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(default_max_connections());
            self.database = Some(DatabaseConfig {
                url: SecretString::from(url),
                max_connections,
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")
                    .unwrap_or(default_connect_timeout()),
            });
        }
        if let Some(provider) = env_parse::<EmbeddingProviderKind>("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Some(min_score) = env_parse("CACHE_MIN_SCORE") {
            self.cache.min_score = min_score;
        }
        if let Some(top_k) = env_parse("CACHE_TOP_K") {
            self.cache.top_k = top_k;
        }
        if let Some(top_n) = env_parse("RETRIEVAL_TOP_N") {
            self.retrieval.top_n = top_n;
        }
        if let Ok(path) = std::env::var("SCHEMA_FILE") {
            self.retrieval.schema_file = Some(PathBuf::from(path));
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.log.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.log.format = format;
        }
    }

    /// Check thresholds, weights and URLs
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.cache.min_score) {
            return Err(Error::Config(format!(
                "cache.min_score must be within [0, 1], got {}",
                self.cache.min_score
            )));
        }
        if self.cache.top_k == 0 {
            return Err(Error::Config("cache.top_k must be at least 1".to_string()));
        }
        if self.retrieval.top_n == 0 {
            return Err(Error::Config("retrieval.top_n must be at least 1".to_string()));
        }
        let (kw, sem) = (self.retrieval.keyword_weight, self.retrieval.semantic_weight);
        if kw < 0.0 || sem < 0.0 || kw + sem == 0.0 {
            return Err(Error::Config(
                "retrieval weights must be non-negative and not both zero".to_string(),
            ));
        }
        if self.embedding.provider == EmbeddingProviderKind::Hashing
            && self.embedding.hashing_dimensions == 0
        {
            return Err(Error::Config("embedding.hashing_dimensions must be positive".to_string()));
        }
        url::Url::parse(&self.generation.base_url)
            .map_err(|e| Error::Config(format!("Invalid generation.base_url: {}", e)))?;
        Ok(())
    }

    /// Additional checks for commands that call the generation engine
    pub fn validate_for_generation(&self) -> Result<()> {
        self.validate()?;
        if self.generation.api_key.expose_secret().is_empty() {
            return Err(Error::Config("OPENROUTER_API_KEY is required".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
