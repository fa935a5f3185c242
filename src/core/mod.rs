//! Core module - Fundamental traits and types for OpenQuery
//!
//! This module defines the seams to the external collaborators:
//! - Provider traits for embedding models and generation engines
//! - Storage traits for similarity (vector + keyword) backends
//! - Shared message and payload types

pub mod provider;
pub mod storage;
pub mod types;

pub use provider::{EmbeddingProvider, GenerationEngine};
pub use storage::{EmbeddingSpace, KeywordHit, ScoredRecord, SimilarityStore, StoredRecord};
pub use types::*;
