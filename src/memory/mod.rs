//! Memory module - short-term turns, long-term answer cache, schema retrieval
//!
//! Orchestrates local embeddings (fastembed or feature hashing), in-process
//! embedding caching (moka), the semantic answer cache, and hybrid
//! keyword + semantic retrieval of schema context.

pub mod cache;
pub mod conversation;
pub mod embedding;
pub mod retrieval;
pub mod semantic_cache;

pub use cache::CachedEmbedder;
pub use conversation::{ConversationMemory, NewTurn, Turn, DEFAULT_RECENT_TURNS};
pub use embedding::{FastEmbedProvider, HashingEmbedder};
pub use retrieval::{
    context_fingerprint, format_snippets, load_schema_file, ContextRetriever, ContextSnippet,
    SchemaField,
};
pub use semantic_cache::{CacheEntry, SemanticCache, SimilarityMatch};
