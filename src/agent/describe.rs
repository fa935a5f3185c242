//! Filling in missing schema descriptions from sampled data
//!
//! Catalogs rarely carry comments. Each table and column without one is
//! described by the generation engine from a handful of sampled rows.
//! Descriptions that already exist are never overwritten.

use crate::agent::prompts::{column_description_template, table_description_template, PromptTemplate};
use crate::core::GenerationEngine;
use crate::error::Result;
use crate::memory::SchemaField;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sampled rows keyed by `schema.table`, each row a JSON object
pub type TableSamples = HashMap<String, Vec<Value>>;

const MAX_COLUMN_SAMPLES: usize = 10;
const MAX_TABLE_ROWS: usize = 3;
const MAX_CELL_CHARS: usize = 50;
const MAX_LISTED_COLUMNS: usize = 10;
const MAX_ROWS_CHARS: usize = 2000;

#[derive(Serialize)]
struct ColumnPrompt<'a> {
    column: &'a str,
    data_type: &'a str,
    table: String,
    samples: String,
}

#[derive(Serialize)]
struct TablePrompt {
    table: String,
    columns: String,
    more_columns: bool,
    column_count: usize,
    rows: String,
}

/// What a finished request describes
enum Target {
    Table(String),
    Column(usize),
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// One line, without surrounding quotes
fn clean_description(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = text.trim_matches(|c| c == '"' || c == '\'').trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Writes descriptions for undocumented tables and columns
pub struct SchemaDescriber {
    engine: Arc<dyn GenerationEngine>,
    column_template: PromptTemplate,
    table_template: PromptTemplate,
    concurrency: usize,
    timeout: Duration,
}

impl SchemaDescriber {
    /// At most `concurrency` requests run at once, each bounded by `timeout`
    pub fn new(engine: Arc<dyn GenerationEngine>, concurrency: usize, timeout: Duration) -> Result<Self> {
        Ok(SchemaDescriber {
            engine,
            column_template: column_description_template()?,
            table_template: table_description_template()?,
            concurrency: concurrency.max(1),
            timeout,
        })
    }

    /// Fill empty descriptions from the samples
    ///
    /// A column whose samples are all null gets a description naming its
    /// type. A failed request leaves its description empty.
    pub async fn describe(&self, mut fields: Vec<SchemaField>, samples: &TableSamples) -> Result<Vec<SchemaField>> {
        let mut jobs: Vec<(Target, String)> = Vec::new();

        let mut tables: Vec<String> = Vec::new();
        for field in &fields {
            let table = field.qualified_table();
            if !tables.contains(&table) {
                tables.push(table);
            }
        }

        for table in tables {
            let members: Vec<&SchemaField> = fields.iter().filter(|f| f.qualified_table() == table).collect();
            let documented = members.iter().any(|f| !f.table_description.trim().is_empty());
            let rows = samples.get(&table).map(Vec::as_slice).unwrap_or_default();
            if documented || rows.is_empty() {
                continue;
            }

            let prompt = self.table_template.render(&TablePrompt {
                table: table.clone(),
                columns: members
                    .iter()
                    .take(MAX_LISTED_COLUMNS)
                    .map(|f| f.column.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                more_columns: members.len() > MAX_LISTED_COLUMNS,
                column_count: members.len(),
                rows: preview_rows(rows),
            })?;
            jobs.push((Target::Table(table), prompt));
        }

        for (index, field) in fields.iter_mut().enumerate() {
            if !field.description.trim().is_empty() {
                continue;
            }
            let table = field.qualified_table();
            let values: Vec<String> = samples
                .get(&table)
                .into_iter()
                .flatten()
                .filter_map(|row| row.get(&field.column))
                .filter(|v| !v.is_null())
                .take(MAX_COLUMN_SAMPLES)
                .map(render_value)
                .collect();

            if values.is_empty() {
                field.description = format!("{} column in {}", field.data_type, table);
                continue;
            }

            let prompt = self.column_template.render(&ColumnPrompt {
                column: &field.column,
                data_type: &field.data_type,
                table,
                samples: values.join(", "),
            })?;
            jobs.push((Target::Column(index), prompt));
        }

        let requested = jobs.len();
        let results: Vec<(Target, Option<String>)> = stream::iter(jobs)
            .map(|(target, prompt)| async move {
                let description = self.request(&prompt).await;
                (target, description)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut described = 0;
        for (target, description) in results {
            let Some(description) = description else {
                continue;
            };
            described += 1;
            match target {
                Target::Table(table) => {
                    for field in fields.iter_mut().filter(|f| f.qualified_table() == table) {
                        field.table_description = description.clone();
                    }
                }
                Target::Column(index) => fields[index].description = description,
            }
        }

        info!(requested, described, "Described schema fields");
        Ok(fields)
    }

    async fn request(&self, prompt: &str) -> Option<String> {
        match timeout(self.timeout, self.engine.complete(prompt)).await {
            Ok(Ok(raw)) => {
                let description = clean_description(&raw);
                if description.is_none() {
                    debug!("Empty description from engine");
                }
                description
            }
            Ok(Err(failure)) => {
                warn!(error = %failure, "Description request failed");
                None
            }
            Err(_) => {
                warn!("Description request timed out");
                None
            }
        }
    }
}

/// First rows with long cells cut short, as pretty JSON
fn preview_rows(rows: &[Value]) -> String {
    let preview: Vec<Value> = rows
        .iter()
        .take(MAX_TABLE_ROWS)
        .map(|row| match row {
            Value::Object(cells) => Value::Object(
                cells
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(truncate_chars(&render_value(v), MAX_CELL_CHARS))))
                    .collect::<Map<String, Value>>(),
            ),
            other => other.clone(),
        })
        .collect();
    let text = serde_json::to_string_pretty(&preview).unwrap_or_default();
    truncate_chars(&text, MAX_ROWS_CHARS)
}
