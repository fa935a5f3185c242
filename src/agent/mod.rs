//! Agent module - SQL generation pipeline and OpenRouter client
//!
//! This module handles all generation-related functionality:
//! - OpenRouter API client implementing the generation engine
//! - Prompt templates for text-to-SQL
//! - Cleaning raw model output down to one statement
//! - Describing undocumented schema fields from sampled rows
//! - The per-request orchestrator state machine

mod cleaning;
mod client;
mod describe;
mod orchestrator;
pub mod prompts;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cleaning::clean_sql;
pub use client::OpenRouterClient;
pub use describe::{SchemaDescriber, TableSamples};
pub use orchestrator::{Answer, AnswerSource, AskOutcome, Orchestrator, Selection};
pub use prompts::{PromptTemplate, SqlPromptContext};
pub use types::{ChatCompletionRequest, ChatCompletionResponse, Usage};
