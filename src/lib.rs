//! # OpenQuery
//!
//! Conversational text-to-SQL with memory, built with Rust.
//!
//! ## Features
//!
//! - **Conversation Memory:** Follow-up questions see the turns before them
//! - **Semantic Cache:** Similar past questions are offered for reuse, never reused silently
//! - **Hybrid Schema Retrieval:** Keyword and vector search over the database catalog
//! - **OpenRouter Integration:** Any chat model drafts the SQL through a single API key
//! - **PostgreSQL + pgvector:** Optional persistence for the cache and schema corpus

pub mod agent;
pub mod app;
pub mod config;
pub mod core;
pub mod database;
pub mod error;
pub mod memory;
pub mod telemetry;

pub use app::{App, SchemaSource};
pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
