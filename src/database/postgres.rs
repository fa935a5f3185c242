//! PostgreSQL connection pool and migrations

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, warn};

/// Shared pool handle
pub type PostgresPool = PgPool;

/// Connect and require the `vector` extension
pub async fn init_pool(config: &DatabaseConfig) -> Result<PostgresPool> {
    let pool = connect(config).await?;
    if !has_pgvector(&pool).await? {
        return Err(Error::Database(sqlx::Error::Configuration(
            "pgvector is not installed in this database; run `openquery migrate` \
             or CREATE EXTENSION vector as a superuser"
                .into(),
        )));
    }
    Ok(pool)
}

/// Connect without the extension check, so migrations can install it
pub async fn init_pool_for_migrations(config: &DatabaseConfig) -> Result<PostgresPool> {
    connect(config).await
}

async fn connect(config: &DatabaseConfig) -> Result<PostgresPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(config.url.expose_secret())
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!(max_connections = config.max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

async fn has_pgvector(pool: &PgPool) -> Result<bool> {
    let (installed,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'vector')")
            .fetch_one(pool)
            .await?;
    Ok(installed)
}

/// Schema migrations
///
/// Only the shared bookkeeping lives here; collection tables are created on
/// first bind because their vector width depends on the embedding model.
pub mod migrations {
    use super::*;

    /// Apply all migrations; safe to run repeatedly
    pub async fn run(pool: &PgPool) -> Result<()> {
        if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(pool)
            .await
        {
            // Non-superusers cannot create extensions; an existing install still works
            warn!(error = %e, "Could not create the pgvector extension");
        }

        // One embedding model per collection
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embedding_spaces (
                collection TEXT PRIMARY KEY,
                model_id TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        info!("Database migrations applied");
        Ok(())
    }
}
