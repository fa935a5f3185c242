//! Prompt templates for SQL generation

use crate::error::{Error, Result};
use crate::memory::{format_snippets, ContextSnippet, Turn};
use handlebars::Handlebars;
use serde::Serialize;

/// A prompt template using Handlebars syntax
///
/// Output is not HTML-escaped; quoted identifiers must reach the model intact.
pub struct PromptTemplate {
    /// Template name
    name: String,
    /// Handlebars registry
    registry: Handlebars<'static>,
}

impl PromptTemplate {
    /// Create a new prompt template
    pub fn new(name: impl Into<String>, template: &str) -> Result<Self> {
        let name = name.into();
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);

        registry
            .register_template_string(&name, template)
            .map_err(|e| Error::Internal(format!("Invalid template: {}", e)))?;

        Ok(PromptTemplate { name, registry })
    }

    /// Render the template with given data
    pub fn render<T: Serialize>(&self, data: &T) -> Result<String> {
        self.registry
            .render(&self.name, data)
            .map_err(|e| Error::Internal(format!("Template render error: {}", e)))
    }
}

/// Default text-to-SQL prompt
pub const TEXT_TO_SQL_TEMPLATE: &str = r#"You are a PostgreSQL expert. Write one SQL query that answers the question below.
{{#if history}}

Conversation so far (oldest first):
{{#each history}}
[{{turn_id}}] Question: {{question}}
[{{turn_id}}] SQL: {{sql}}
{{/each}}
{{/if}}
{{#if last_output}}

The question may refer to earlier results with words such as "that", "it", "those" or "now only".
Resolve such references against the most recent query and modify it instead of starting over:
{{last_output}}
{{/if}}

Available database schema:
{{#if schema_context}}
{{schema_context}}
{{else}}
(no matching schema found; use only identifiers that appear in the conversation)
{{/if}}

Instructions:
- Use every identifier exactly as written in the schema above, including double quotes
- PostgreSQL is case-sensitive: never change the casing of a quoted identifier
- Use schema.table notation and include JOINs where needed
- Return ONLY the SQL query, with no explanation and no markdown

Question: {{question}}
SQL Query:"#;

/// One earlier exchange as shown to the model
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// Audit number of the turn
    pub turn_id: u64,
    /// The question asked
    pub question: String,
    /// The active SQL for that question
    pub sql: String,
}

/// Everything the SQL prompt is rendered from
#[derive(Debug, Clone, Serialize)]
pub struct SqlPromptContext {
    /// Prior turns, oldest first
    pub history: Vec<HistoryEntry>,
    /// Structured output of the most recent turn
    pub last_output: Option<String>,
    /// Retrieved schema, grouped by table
    pub schema_context: String,
    /// The current question
    pub question: String,
}

impl SqlPromptContext {
    /// Assemble from recent turns (oldest first) and retrieved snippets
    pub fn new(turns: &[Turn], snippets: &[ContextSnippet], question: &str) -> Self {
        SqlPromptContext {
            history: turns
                .iter()
                .map(|t| HistoryEntry {
                    turn_id: t.turn_id,
                    question: t.input_text.clone(),
                    sql: t.structured_output.clone(),
                })
                .collect(),
            last_output: turns.last().map(|t| t.structured_output.clone()),
            schema_context: format_snippets(snippets).trim_end().to_string(),
            question: question.to_string(),
        }
    }
}

/// The built-in text-to-SQL template
pub fn text_to_sql_template() -> Result<PromptTemplate> {
    PromptTemplate::new("text_to_sql", TEXT_TO_SQL_TEMPLATE)
}

/// Asks for a one-line description of a column from sampled values
pub const COLUMN_DESCRIPTION_TEMPLATE: &str = r#"Based on these sample values from column '{{column}}' (type: {{data_type}}) in table '{{table}}':
{{samples}}

Describe in at most 40 words what this column contains. Reply with the description only."#;

/// Asks for a short description of a table from sampled rows
pub const TABLE_DESCRIPTION_TEMPLATE: &str = r#"Based on this sample data from table '{{table}}':

Columns: {{columns}}{{#if more_columns}}, ...{{/if}}
Total columns: {{column_count}}

Sample rows:
{{rows}}

Describe in at most 60 words what this table stores and its business purpose. Reply with the description only."#;

pub fn column_description_template() -> Result<PromptTemplate> {
    PromptTemplate::new("column_description", COLUMN_DESCRIPTION_TEMPLATE)
}

pub fn table_description_template() -> Result<PromptTemplate> {
    PromptTemplate::new("table_description", TABLE_DESCRIPTION_TEMPLATE)
}
