//! Schema corpus extraction from a live PostgreSQL database

use crate::database::PostgresPool;
use crate::error::Result;
use crate::memory::retrieval::quote_ident;
use crate::memory::SchemaField;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::info;

#[derive(FromRow)]
struct ColumnRow {
    table_schema: String,
    table_name: String,
    column_name: String,
    data_type: String,
    description: String,
    table_description: String,
}

/// Read every column of every base table outside `exclude_schemas`
///
/// Column and table comments become the field descriptions.
pub async fn extract_schema_fields(
    pool: &PostgresPool,
    exclude_schemas: &[String],
) -> Result<Vec<SchemaField>> {
    let rows: Vec<ColumnRow> = sqlx::query_as(
        r#"
        SELECT
            c.table_schema::TEXT AS table_schema,
            c.table_name::TEXT AS table_name,
            c.column_name::TEXT AS column_name,
            c.data_type::TEXT AS data_type,
            COALESCE(
                col_description(format('%I.%I', c.table_schema, c.table_name)::regclass,
                                c.ordinal_position::INT),
                ''
            )::TEXT AS description,
            COALESCE(
                obj_description(format('%I.%I', c.table_schema, c.table_name)::regclass, 'pg_class'),
                ''
            )::TEXT AS table_description
        FROM information_schema.columns c
        JOIN information_schema.tables t
          ON t.table_schema = c.table_schema AND t.table_name = c.table_name
        WHERE t.table_type = 'BASE TABLE'
          AND c.table_schema <> ALL($1)
        ORDER BY c.table_schema, c.table_name, c.ordinal_position
    "#,
    )
    .bind(exclude_schemas)
    .fetch_all(pool)
    .await?;

    let fields: Vec<SchemaField> = rows
        .into_iter()
        .map(|r| SchemaField {
            schema: r.table_schema,
            table: r.table_name,
            column: r.column_name,
            data_type: r.data_type,
            description: r.description,
            table_description: r.table_description,
        })
        .collect();

    info!(columns = fields.len(), "Extracted schema metadata");
    Ok(fields)
}

/// Up to `limit` random rows of a table, each as a JSON object
pub async fn sample_rows(
    pool: &PostgresPool,
    schema: &str,
    table: &str,
    limit: usize,
) -> Result<Vec<serde_json::Value>> {
    let rows: Vec<(Json<serde_json::Value>,)> = sqlx::query_as(&format!(
        "SELECT to_jsonb(t) FROM {}.{} t ORDER BY random() LIMIT $1",
        quote_ident(schema),
        quote_ident(table)
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(row,)| row.0).collect())
}
