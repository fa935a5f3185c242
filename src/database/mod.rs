//! Database module - similarity store backends
//!
//! Provides storage for:
//! - PostgreSQL with pgvector: cosine kNN and tsvector keyword search per collection
//! - In-process store: the same contract without a database
//! - Schema extraction from `information_schema`, plus row sampling

mod in_memory;
mod postgres;
mod schema;
mod vector_store;

pub use in_memory::InMemorySimilarityStore;
pub use postgres::{PostgresPool, init_pool, init_pool_for_migrations, migrations};
pub use schema::{extract_schema_fields, sample_rows};
pub use vector_store::PgSimilarityStore;
